use actix_session::{storage::CookieSessionStore, SessionMiddleware};
use actix_web::cookie::Key;
use actix_web::http::StatusCode;
use actix_web::middleware::{ErrorHandlers, Logger};
use actix_web::{App, HttpServer};
use contenthub::db::init_db;
use contenthub::middleware::ClientCtx;
use env_logger::Env;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    init_lib_mods();
    init_our_mods();
    init_db(std::env::var("DATABASE_URL").expect("DATABASE_URL must be set.")).await;

    contenthub::category::seed_default_category(contenthub::get_db_pool())
        .await
        .expect("Default category failed to seed.");

    let secret_key = session_key();
    let bind = std::env::var("HTTP_BIND").unwrap_or_else(|_| "127.0.0.1:8080".to_owned());

    HttpServer::new(move || {
        // Order of middleware IS IMPORTANT and is in REVERSE EXECUTION ORDER.
        App::new()
            .wrap(
                ErrorHandlers::new()
                    .handler(StatusCode::NOT_FOUND, contenthub::web::error::render_404)
                    .handler(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        contenthub::web::error::render_500,
                    ),
            )
            .wrap(ClientCtx::default())
            .wrap(SessionMiddleware::new(
                CookieSessionStore::default(),
                secret_key.clone(),
            ))
            .wrap(Logger::new("%a %{User-Agent}i"))
            .service(actix_files::Files::new(
                "/uploads",
                contenthub::filesystem::upload_dir(),
            ))
            .configure(contenthub::web::configure)
    })
    .bind(bind)?
    .run()
    .await
}

/// Initialize third party crates we rely on but don't have control over.
fn init_lib_mods() {
    dotenv::dotenv().ok();
    env_logger::Builder::from_env(Env::default().default_filter_or("debug")).init();
}

/// Initialize all local mods.
/// Panics
fn init_our_mods() {
    contenthub::filesystem::init();
    contenthub::mail::init();
}

/// Cookie signing key. Sessions survive restarts only when SESSION_SECRET
/// (64+ bytes) is configured.
fn session_key() -> Key {
    match std::env::var("SESSION_SECRET") {
        Ok(secret) => Key::from(secret.as_bytes()),
        Err(_) => Key::generate(),
    }
}
