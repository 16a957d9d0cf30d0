use actix_web::http::StatusCode;
use actix_web::HttpResponse;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::blockchain::{AccountError, BlockchainError};
use crate::blockchain::miner::MinerError;

/// Body returned with every non-2xx response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({"error": "Invalid nonce: expected 1, got 2"}))]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn respond(status: StatusCode, error: impl ToString) -> HttpResponse {
        HttpResponse::build(status).json(ErrorResponse {
            error: error.to_string(),
        })
    }
}

/// Status code a chain error maps to
pub fn chain_error_status(err: &BlockchainError) -> StatusCode {
    match err {
        BlockchainError::AccountError(AccountError::AccountNotFound(_)) => StatusCode::NOT_FOUND,
        err if err.is_fatal() => StatusCode::SERVICE_UNAVAILABLE,
        BlockchainError::StorageError(_) | BlockchainError::GenesisFailed(_) | BlockchainError::InvalidChain(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
        _ => StatusCode::BAD_REQUEST,
    }
}

pub fn miner_error_status(err: &MinerError) -> StatusCode {
    match err {
        MinerError::AlreadyRunning => StatusCode::CONFLICT,
        MinerError::Stopped => StatusCode::SERVICE_UNAVAILABLE,
        MinerError::Spawn(_) => StatusCode::INTERNAL_SERVER_ERROR,
        MinerError::Chain(err) => chain_error_status(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::storage::StorageError;
    use crate::blockchain::validator::ValidationError;

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(
            chain_error_status(&AccountError::AccountNotFound("x".into()).into()),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            chain_error_status(&AccountError::InvalidNonce { expected: 1, got: 2 }.into()),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            chain_error_status(&ValidationError::InvalidCoinbase("x".into()).into()),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            chain_error_status(&BlockchainError::CommitFailed(StorageError::CommitAborted)),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(miner_error_status(&MinerError::AlreadyRunning), StatusCode::CONFLICT);
    }
}
