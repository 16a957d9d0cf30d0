use std::sync::Arc;

use actix_cors::Cors;
use actix_web::{middleware, web, App, HttpServer};
use log::{error, info};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use powledger::api;
use powledger::blockchain::storage::BlockchainStorage;
use powledger::blockchain::{self, Blockchain, ChainConfig, Miner, Wallet};

const DATA_DIR: &str = "data/blockchain";

fn fatal(err: impl ToString) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Other, err.to_string())
}

// Open the stored chain together with the node wallet kept beside it.
// The wallet owns every earlier reward, so a node never runs without its store.
fn initialize_node(mut config: ChainConfig) -> std::io::Result<(Blockchain, Wallet)> {
    std::fs::create_dir_all(DATA_DIR)?;

    let storage = BlockchainStorage::new(DATA_DIR).map_err(|err| {
        error!("Failed to open storage at {}: {}", DATA_DIR, err);
        fatal(err)
    })?;
    let wallet = storage.load_or_create_wallet().map_err(fatal)?;
    info!("Node wallet address: {}", wallet.address());

    config.treasury_address = wallet.address().clone();
    config
        .validate()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err.to_string()))?;

    let blockchain = Blockchain::from_storage(storage, config).map_err(fatal)?;
    info!("Loaded blockchain from storage at {}", DATA_DIR);
    Ok((blockchain, wallet))
}

#[derive(OpenApi)]
#[openapi(
    paths(
        api::handlers::get_chain,
        api::handlers::get_block,
        api::handlers::validate_chain,
        api::handlers::get_pending_transactions,
        api::handlers::new_transaction,
        api::handlers::mine_block,
        api::handlers::create_wallet,
        api::handlers::get_all_accounts,
        api::handlers::get_account,
        api::handlers::get_supply,
        api::handlers::get_miner_metrics,
        api::handlers::start_miner,
        api::handlers::stop_miner
    ),
    components(
        schemas(
            blockchain::Block,
            blockchain::Transaction,
            blockchain::transaction::TransactionType,
            blockchain::Account,
            blockchain::Address,
            blockchain::DigitalSignature,
            blockchain::MinerMetrics,
            blockchain::MinerState,
            api::schema::ErrorResponse,
            api::handlers::ChainResponse,
            api::handlers::TransactionRequest,
            api::handlers::TransactionResponse,
            api::handlers::MineRequest,
            api::handlers::MineResponse,
            api::handlers::WalletResponse,
            api::handlers::SupplyResponse
        )
    ),
    tags(
        (name = "powledger", description = "Proof-of-work chain and ledger endpoints")
    ),
    info(
        title = "powledger API",
        version = "0.1.0",
        description = "Single-node proof-of-work block producer with an account ledger",
        license(
            name = "MIT",
            url = "https://opensource.org/licenses/MIT"
        )
    )
)]
struct ApiDoc;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    // Initialize logger
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    // The node wallet receives the genesis allocation and every mined reward
    let (chain, wallet) = initialize_node(ChainConfig::default())?;
    let chain = Arc::new(chain);
    info!(
        "Chain at height {:?}, next difficulty {}",
        chain.height(),
        chain.next_difficulty()
    );

    let miner = web::Data::new(Miner::new(Arc::clone(&chain), wallet.address().clone()));
    let blockchain = web::Data::from(chain);

    info!("Starting HTTP server at http://localhost:8080");

    let server_miner = miner.clone();
    let result = HttpServer::new(move || {
        // Configure CORS
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        let openapi = ApiDoc::openapi();

        App::new()
            .wrap(middleware::Logger::default())
            .wrap(cors)
            .app_data(blockchain.clone())
            .app_data(server_miner.clone())
            .configure(api::configure_routes)
            .service(
                SwaggerUi::new("/swagger-ui/{_:.*}")
                    .url("/api-docs/openapi.json", openapi.clone())
            )
    })
    .bind(("127.0.0.1", 8080))?
    .run()
    .await;

    miner.stop();
    result
}
