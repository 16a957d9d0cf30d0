use actix_web::web;

use super::handlers;

/// Configures the API routes
///
/// # Arguments
///
/// * `cfg` - The service configuration
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            .route("/chain", web::get().to(handlers::get_chain))
            .route("/blocks/{height}", web::get().to(handlers::get_block))
            .route("/validate", web::get().to(handlers::validate_chain))
            .route("/transactions/pending", web::get().to(handlers::get_pending_transactions))
            .route("/transactions/new", web::post().to(handlers::new_transaction))
            .route("/mine", web::post().to(handlers::mine_block))
            .route("/wallet/new", web::post().to(handlers::create_wallet))
            .route("/accounts", web::get().to(handlers::get_all_accounts))
            .route("/accounts/{address}", web::get().to(handlers::get_account))
            .route("/supply", web::get().to(handlers::get_supply))
            .route("/miner/metrics", web::get().to(handlers::get_miner_metrics))
            .route("/miner/start", web::post().to(handlers::start_miner))
            .route("/miner/stop", web::post().to(handlers::stop_miner))
    );
}
