mod bootstrap;
mod engine;
mod settings;
mod state;
mod status_api;
mod symbols;

#[cfg(test)]
mod tests;

#[tokio::main]
async fn main() -> std::process::ExitCode {
    match bootstrap::async_main().await {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("fatal: {err:#}");
            std::process::ExitCode::FAILURE
        }
    }
}
