use actix_web::http::StatusCode;
use actix_web::{web, HttpResponse, Responder};
use log::warn;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::schema::{chain_error_status, miner_error_status, ErrorResponse};
use crate::blockchain::{
    Account, Address, Block, Blockchain, BlockchainError, Miner, MinerMetrics, SupplyStats, Transaction, Wallet,
};

/// Data structure for the blockchain state
pub type BlockchainData = web::Data<Blockchain>;

/// The node's background miner
pub type MinerData = web::Data<Miner>;

/// Response for the chain endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct ChainResponse {
    /// The length of the chain
    pub length: usize,

    /// The blocks in the chain
    pub chain: Vec<Block>,

    /// Whether the chain is valid
    pub is_valid: bool,
}

/// Request for the transaction endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct TransactionRequest {
    /// The sender's address
    pub sender: String,

    /// The recipient's address
    pub recipient: String,

    /// The amount to transfer
    pub amount: u64,

    /// The transaction fee
    #[serde(default)]
    pub fee: u64,

    /// Sequence number; the sender's next free nonce when omitted
    #[serde(default)]
    pub nonce: Option<u64>,

    /// The sender's private key (for signing)
    pub private_key: String,
}

/// Response for the transaction endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct TransactionResponse {
    /// The message
    pub message: String,

    /// The id of the queued transaction
    pub transaction_id: String,

    /// The index of the block that will include this transaction
    pub block_index: u64,
}

/// Request for the mine endpoint
#[derive(Serialize, Deserialize, ToSchema, Default)]
pub struct MineRequest {
    /// Address credited with the reward; the node's miner address when omitted
    #[serde(default)]
    pub miner_address: Option<String>,
}

/// Response for the mine endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct MineResponse {
    /// The message
    pub message: String,

    /// The newly mined block
    pub block: Block,
}

/// Response for the create wallet endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct WalletResponse {
    /// The wallet's address
    pub address: String,

    /// The wallet's private key (hex encoded)
    pub private_key: String,
}

/// Response for the supply endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct SupplyResponse {
    pub minted: u64,
    pub burned: u64,

    /// Sum of all account balances
    pub circulating: u64,
}

/// Get the full blockchain
///
/// Returns the entire blockchain and its validity status
#[utoipa::path(
    get,
    path = "/api/v1/chain",
    responses(
        (status = 200, description = "Blockchain retrieved successfully", body = ChainResponse)
    )
)]
pub async fn get_chain(blockchain: BlockchainData) -> impl Responder {
    let chain = blockchain.chain();
    let is_valid = blockchain.is_valid();

    let response = ChainResponse {
        length: chain.len(),
        chain,
        is_valid,
    };

    HttpResponse::Ok().json(response)
}

/// Get a block by height
#[utoipa::path(
    get,
    path = "/api/v1/blocks/{height}",
    params(("height" = u64, Path, description = "Block height")),
    responses(
        (status = 200, description = "Block found", body = Block),
        (status = 404, description = "No block at this height", body = ErrorResponse)
    )
)]
pub async fn get_block(blockchain: BlockchainData, height: web::Path<u64>) -> impl Responder {
    let height = height.into_inner();
    match blockchain.block(height) {
        Some(block) => HttpResponse::Ok().json(block),
        None => ErrorResponse::respond(StatusCode::NOT_FOUND, format!("Block at height {} not found", height)),
    }
}

/// Get all pending transactions
///
/// Returns all transactions waiting to be included in a block
#[utoipa::path(
    get,
    path = "/api/v1/transactions/pending",
    responses(
        (status = 200, description = "Pending transactions retrieved successfully", body = Vec<Transaction>)
    )
)]
pub async fn get_pending_transactions(blockchain: BlockchainData) -> impl Responder {
    let transactions = blockchain.pending_transactions();
    HttpResponse::Ok().json(transactions)
}

/// Create a new transaction
///
/// Signs a transfer with the given key and queues it for the next block
#[utoipa::path(
    post,
    path = "/api/v1/transactions/new",
    request_body = TransactionRequest,
    responses(
        (status = 201, description = "Transaction created successfully", body = TransactionResponse),
        (status = 400, description = "Invalid transaction data", body = ErrorResponse),
        (status = 503, description = "Chain halted", body = ErrorResponse)
    )
)]
pub async fn new_transaction(
    blockchain: BlockchainData,
    transaction_req: web::Json<TransactionRequest>,
) -> impl Responder {
    let request = transaction_req.into_inner();

    let private_key_bytes = match hex::decode(&request.private_key) {
        Ok(bytes) => bytes,
        Err(_) => {
            return ErrorResponse::respond(
                StatusCode::BAD_REQUEST,
                "Invalid private key format. Must be a hex string.",
            );
        }
    };

    let wallet = match Wallet::from_secret_key(&private_key_bytes) {
        Ok(wallet) => wallet,
        Err(err) => return ErrorResponse::respond(StatusCode::BAD_REQUEST, format!("Invalid private key: {}", err)),
    };

    let sender = Address(request.sender);
    if wallet.address() != &sender {
        return ErrorResponse::respond(StatusCode::BAD_REQUEST, "Private key does not match sender address");
    }

    let nonce = request.nonce.unwrap_or_else(|| blockchain.next_nonce(&sender));
    let mut transaction = Transaction::new(sender, Address(request.recipient), request.amount, request.fee, nonce);

    if let Err(err) = transaction.sign(&wallet) {
        return ErrorResponse::respond(StatusCode::BAD_REQUEST, format!("Failed to sign transaction: {}", err));
    }

    let transaction_id = transaction.id.clone();
    match blockchain.add_transaction(transaction) {
        Ok(block_index) => HttpResponse::Created().json(TransactionResponse {
            message: "Transaction will be added to Block".to_string(),
            transaction_id,
            block_index,
        }),
        Err(err) => ErrorResponse::respond(chain_error_status(&err), format!("Failed to add transaction: {}", err)),
    }
}

/// Mine a new block
///
/// Runs one search on a blocking thread and returns the accepted block
#[utoipa::path(
    post,
    path = "/api/v1/mine",
    request_body = MineRequest,
    responses(
        (status = 200, description = "Block mined successfully", body = MineResponse),
        (status = 409, description = "The background miner is running", body = ErrorResponse),
        (status = 503, description = "Chain halted", body = ErrorResponse)
    )
)]
pub async fn mine_block(
    blockchain: BlockchainData,
    miner: MinerData,
    mine_req: Option<web::Json<MineRequest>>,
) -> impl Responder {
    let request = mine_req.map(web::Json::into_inner).unwrap_or_default();

    let result = web::block(move || match request.miner_address {
        Some(address) if address != miner.address().0 => {
            Miner::new(blockchain.into_inner(), Address(address)).mine_block()
        }
        _ => miner.mine_block(),
    })
    .await;

    match result {
        Ok(Ok(block)) => HttpResponse::Ok().json(MineResponse {
            message: "New Block Mined".to_string(),
            block,
        }),
        Ok(Err(err)) => ErrorResponse::respond(miner_error_status(&err), format!("Failed to mine block: {}", err)),
        Err(err) => {
            warn!("Mining task failed: {}", err);
            ErrorResponse::respond(StatusCode::INTERNAL_SERVER_ERROR, "Mining task failed")
        }
    }
}

/// Check if the blockchain is valid
///
/// Re-validates every block and replays the ledger
#[utoipa::path(
    get,
    path = "/api/v1/validate",
    responses(
        (status = 200, description = "Blockchain validation status", body = bool)
    )
)]
pub async fn validate_chain(blockchain: BlockchainData) -> impl Responder {
    let is_valid = blockchain.is_valid();
    HttpResponse::Ok().json(is_valid)
}

/// Create a new wallet
///
/// Creates a new wallet with a random keypair
///
/// The private key must be stored by your own
#[utoipa::path(
    post,
    path = "/api/v1/wallet/new",
    responses(
        (status = 201, description = "Wallet created successfully", body = WalletResponse)
    )
)]
pub async fn create_wallet() -> impl Responder {
    let wallet = Wallet::new();

    HttpResponse::Created().json(WalletResponse {
        address: wallet.address().0.clone(),
        private_key: hex::encode(wallet.export_secret_key()),
    })
}

/// Get all accounts
///
/// Returns every account ordered by address
#[utoipa::path(
    get,
    path = "/api/v1/accounts",
    responses(
        (status = 200, description = "Accounts retrieved successfully", body = Vec<Account>)
    )
)]
pub async fn get_all_accounts(blockchain: BlockchainData) -> impl Responder {
    HttpResponse::Ok().json(blockchain.ledger().accounts())
}

/// Get one account
#[utoipa::path(
    get,
    path = "/api/v1/accounts/{address}",
    params(("address" = String, Path, description = "Account address")),
    responses(
        (status = 200, description = "Account found", body = Account),
        (status = 404, description = "Unknown account", body = ErrorResponse)
    )
)]
pub async fn get_account(blockchain: BlockchainData, address: web::Path<String>) -> impl Responder {
    let address = Address(address.into_inner());
    match blockchain.ledger().account(&address) {
        Ok(account) => HttpResponse::Ok().json(account),
        Err(err) => {
            let err = BlockchainError::from(err);
            ErrorResponse::respond(chain_error_status(&err), err)
        }
    }
}

/// Get supply statistics
#[utoipa::path(
    get,
    path = "/api/v1/supply",
    responses(
        (status = 200, description = "Minted, burned and circulating totals", body = SupplyResponse)
    )
)]
pub async fn get_supply(blockchain: BlockchainData) -> impl Responder {
    let (SupplyStats { minted, burned }, circulating) = blockchain.supply_snapshot();
    HttpResponse::Ok().json(SupplyResponse {
        minted,
        burned,
        circulating,
    })
}

/// Get miner metrics
#[utoipa::path(
    get,
    path = "/api/v1/miner/metrics",
    responses(
        (status = 200, description = "Current miner metrics", body = MinerMetrics)
    )
)]
pub async fn get_miner_metrics(miner: MinerData) -> impl Responder {
    HttpResponse::Ok().json(miner.metrics())
}

/// Start the background miner
#[utoipa::path(
    post,
    path = "/api/v1/miner/start",
    responses(
        (status = 202, description = "Miner started", body = MinerMetrics),
        (status = 409, description = "Miner already running", body = ErrorResponse)
    )
)]
pub async fn start_miner(miner: MinerData) -> impl Responder {
    match miner.start() {
        Ok(()) => HttpResponse::Accepted().json(miner.metrics()),
        Err(err) => ErrorResponse::respond(miner_error_status(&err), err),
    }
}

/// Stop the background miner
///
/// Waits until the in-flight search has been cancelled
#[utoipa::path(
    post,
    path = "/api/v1/miner/stop",
    responses(
        (status = 200, description = "Miner stopped", body = MinerMetrics)
    )
)]
pub async fn stop_miner(miner: MinerData) -> impl Responder {
    let stopper = miner.clone();
    if let Err(err) = web::block(move || stopper.stop()).await {
        warn!("Stopping miner failed: {}", err);
    }
    HttpResponse::Ok().json(miner.metrics())
}
