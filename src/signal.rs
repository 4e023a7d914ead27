/*
 * Copyright 2023 Google LLC
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Process shutdown, shared by informers, controller workers, the batch
//! loop and the gRPC servers.

/// Receiver for a shutdown event.
pub type ShutdownRx = tokio::sync::watch::Receiver<ShutdownKind>;
pub type ShutdownTx = tokio::sync::watch::Sender<ShutdownKind>;

#[derive(Copy, Clone, PartialEq, Eq, Default, Debug)]
pub enum ShutdownKind {
    /// Workers finish the key or batch in hand before stopping.
    #[default]
    Normal,
    /// Tests tearing down a harness, nothing needs draining.
    Testing,
}

pub fn channel(kind: ShutdownKind) -> (ShutdownTx, ShutdownRx) {
    tokio::sync::watch::channel(kind)
}

/// Resolves once a shutdown has been requested, or the sender is gone.
pub async fn shutdown(mut rx: ShutdownRx) {
    let _ = rx.changed().await;
}

/// Listens for SIGINT and SIGTERM, returning the receiver that fires on the
/// first of them.
pub fn spawn_handler() -> ShutdownRx {
    let (tx, rx) = channel(ShutdownKind::Normal);
    crate::metrics::shutdown_initiated().set(0);

    tokio::spawn(async move {
        let signal = wait_for_signal().await;
        crate::metrics::shutdown_initiated().set(1);
        tracing::info!(%signal, "shutting down from signal");
        // Nobody listening is fine, the process is going away regardless.
        let _ = tx.send(ShutdownKind::Normal);
    });

    rx
}

#[cfg(unix)]
async fn wait_for_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => Some(terminate),
        Err(error) => {
            tracing::warn!(%error, "unable to listen for SIGTERM");
            None
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => "SIGINT",
        Some(_) = async {
            match terminate.as_mut() {
                Some(terminate) => terminate.recv().await,
                None => std::future::pending().await,
            }
        } => "SIGTERM",
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> &'static str {
    let _ = tokio::signal::ctrl_c().await;
    "SIGINT"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn shutdown_resolves_on_send_and_on_drop() {
        let (tx, rx) = channel(ShutdownKind::Normal);
        let waiting = tokio::spawn(shutdown(rx.clone()));
        tx.send(ShutdownKind::Testing).unwrap();
        waiting.await.unwrap();
        assert_eq!(ShutdownKind::Testing, *rx.borrow());

        let (tx, rx) = channel(ShutdownKind::Normal);
        drop(tx);
        tokio::time::timeout(std::time::Duration::from_secs(1), shutdown(rx))
            .await
            .unwrap();
    }
}
