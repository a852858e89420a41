//! Transparent HTTP upgrade relay
//!
//! The upgrade handshake is forwarded as an ordinary request. Once the
//! downstream answers 101, both upgraded connections are bridged as raw byte
//! streams, so WebSocket, SPDY or any other upgrade protocol works without
//! parsing frames.

use axum::body::Body;
use http::Response;
use hyper::body::Incoming;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use tracing::{debug, info, warn};

/// Bridge the caller's connection with the downstream's after a 101
///
/// Returns the 101 response to hand back to the caller. The bridge runs in
/// its own task and ends when either side closes or fails; both legs are
/// dropped together.
pub(crate) fn bridge(
    client: OnUpgrade,
    mut response: Response<Incoming>,
    cluster: &str,
) -> Response<Body> {
    let downstream = hyper::upgrade::on(&mut response);
    let cluster = cluster.to_string();

    tokio::spawn(async move {
        let (client, downstream) = match tokio::try_join!(client, downstream) {
            Ok(upgraded) => upgraded,
            Err(e) => {
                warn!(cluster = %cluster, error = %e, "Failed to complete upgrade");
                return;
            }
        };

        // hyper::Upgraded needs TokioIo adapter for tokio AsyncRead/Write
        let mut client = TokioIo::new(client);
        let mut downstream = TokioIo::new(downstream);

        match tokio::io::copy_bidirectional(&mut client, &mut downstream).await {
            Ok((from_client, from_downstream)) => {
                info!(
                    cluster = %cluster,
                    from_client,
                    from_downstream,
                    "Upgraded session ended"
                );
            }
            Err(e) => {
                debug!(cluster = %cluster, error = %e, "Upgraded session closed with error");
            }
        }
    });

    let (parts, _) = response.into_parts();
    Response::from_parts(parts, Body::empty())
}
