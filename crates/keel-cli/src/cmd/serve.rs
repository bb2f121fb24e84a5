use anyhow::Context;
use std::net::SocketAddr;
use std::path::Path;

pub fn run(root: &Path, bind: &str, port: u16) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{bind}:{port}")
        .parse()
        .with_context(|| format!("invalid bind address '{bind}'"))?;
    let root_buf = root.to_path_buf();

    super::runtime()?.block_on(async move {
        tokio::select! {
            result = keel_server::serve(root_buf, addr) => result,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutting down");
                Ok(())
            }
        }
    })
}
