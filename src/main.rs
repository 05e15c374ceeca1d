use s5tun::config::Config;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = Config::load()?;
    tracing::info!(
        socks_server = %config.socks_server,
        socks_port = config.socks_port,
        tcp_listen_port = config.tcp_listen_port,
        dns_mode = ?config.dns_mode,
        "s5tun: starting"
    );

    s5tun::run(config).await
}
