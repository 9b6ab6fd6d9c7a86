//! TCP listener (spec §4.1): accepts connections and spawns one session
//! task per socket. Owns nothing but the accept loop itself.

use crate::session::{Session, SessionContext};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;

/// Accepts connections until `shutdown` fires, then stops accepting new
/// sockets (spec §5: "the listener stops accepting"). Sessions already
/// spawned watch the same signal to drain and close on their own.
pub async fn serve(bind_addr: &str, ctx: Arc<SessionContext>, mut shutdown: watch::Receiver<bool>) -> std::io::Result<()> {
    let listener = TcpListener::bind(bind_addr).await?;
    tracing::info!(addr = bind_addr, "listening");
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                tracing::debug!(peer = %peer, "accepted");
                Session::spawn(ctx.clone(), stream, peer, shutdown.clone());
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    tracing::info!("listener_stopping_accept");
                    return Ok(());
                }
            }
        }
    }
}
