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

//! The allocator's gRPC endpoint.

use std::sync::Arc;

use eyre::WrapErr;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::{Certificate, Identity, Server, ServerTlsConfig};

use super::{convert, processor::ProcessorService, Allocator};
use crate::{
    config,
    generated::allocation::{
        allocation_service_server::{self, AllocationServiceServer},
        processor_server::ProcessorServer,
        AllocationRequest, AllocationResponse,
    },
    signal::{self, ShutdownRx},
};

/// Serves `Allocate` over the local allocator. Running out of game servers
/// and contention are reported in the response state, not as errors.
#[derive(Clone)]
pub struct AllocationService {
    allocator: Arc<Allocator>,
}

impl AllocationService {
    pub fn new(allocator: Arc<Allocator>) -> Self {
        Self { allocator }
    }
}

#[tonic::async_trait]
impl allocation_service_server::AllocationService for AllocationService {
    #[tracing::instrument(skip_all)]
    async fn allocate(
        &self,
        request: tonic::Request<AllocationRequest>,
    ) -> Result<tonic::Response<AllocationResponse>, tonic::Status> {
        let allocation = convert::to_allocation(request.into_inner());
        match self.allocator.allocate(allocation).await {
            Ok(status) => Ok(tonic::Response::new(convert::to_response(&status))),
            Err(error) => {
                tracing::debug!(%error, "allocation failed");
                Err(error.to_status())
            }
        }
    }
}

fn server_tls(tls: &config::Tls) -> crate::Result<ServerTlsConfig> {
    let cert = std::fs::read(&tls.cert_file)
        .wrap_err_with(|| format!("failed to read {}", tls.cert_file.display()))?;
    let key = std::fs::read(&tls.key_file)
        .wrap_err_with(|| format!("failed to read {}", tls.key_file.display()))?;

    let mut config = ServerTlsConfig::new().identity(Identity::from_pem(cert, key));
    if let Some(path) = &tls.client_ca_file {
        let ca = std::fs::read(path)
            .wrap_err_with(|| format!("failed to read {}", path.display()))?;
        config = config.client_ca_root(Certificate::from_pem(ca));
    }

    Ok(config)
}

/// Binds the configured address and serves until `shutdown` fires.
pub async fn serve(
    config: &config::Grpc,
    allocator: Arc<Allocator>,
    shutdown: ShutdownRx,
) -> crate::Result<()> {
    let listener = TcpListener::bind(config.address)
        .await
        .wrap_err_with(|| format!("failed to bind {}", config.address))?;
    serve_with_listener(listener, config, allocator, shutdown).await
}

/// Serves the allocation and processor services on `listener`.
pub async fn serve_with_listener(
    listener: TcpListener,
    config: &config::Grpc,
    allocator: Arc<Allocator>,
    shutdown: ShutdownRx,
) -> crate::Result<()> {
    let mut builder = Server::builder();
    if let Some(tls) = &config.tls {
        builder = builder.tls_config(server_tls(tls)?)?;
    }

    tracing::info!(address = %listener.local_addr()?, tls = config.tls.is_some(), "serving allocation service");
    builder
        .add_service(AllocationServiceServer::new(AllocationService::new(
            allocator.clone(),
        )))
        .add_service(ProcessorServer::new(ProcessorService::new(
            allocator,
            config.pull_interval(),
            shutdown.clone(),
        )))
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), signal::shutdown(shutdown))
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        generated::allocation::{
            allocation_response::AllocationState, allocation_service_client::AllocationServiceClient,
            GameServerSelector,
        },
        test::Harness,
    };

    #[tokio::test]
    async fn allocates_over_grpc() {
        let harness = Harness::new(10, 20).await;
        harness.ready_game_server("gs-1", "node-1").await;
        let address = harness.serve_grpc(harness.allocator(Vec::new())).await;

        let mut client = AllocationServiceClient::connect(format!("http://{address}"))
            .await
            .unwrap();
        let request = AllocationRequest {
            namespace: "default".into(),
            required_game_server_selector: Some(GameServerSelector::default()),
            ..<_>::default()
        };

        let response = client.allocate(request.clone()).await.unwrap().into_inner();
        assert_eq!(AllocationState::Allocated, response.state());
        assert_eq!("gs-1", response.game_server_name);
        assert_eq!("local", response.source);

        let response = client.allocate(request).await.unwrap().into_inner();
        assert_eq!(AllocationState::UnAllocated, response.state());

        let invalid = AllocationRequest {
            namespace: "default".into(),
            required_game_server_selector: Some(GameServerSelector {
                match_labels: [("bad key!".to_owned(), "v".to_owned())].into(),
                ..<_>::default()
            }),
            ..<_>::default()
        };
        let status = client.allocate(invalid).await.unwrap_err();
        assert_eq!(tonic::Code::InvalidArgument, status.code());
    }

    #[test]
    fn missing_tls_files_fail() {
        let tls = config::Tls {
            cert_file: "/nonexistent/tls.crt".into(),
            key_file: "/nonexistent/tls.key".into(),
            client_ca_file: None,
        };
        assert!(server_tls(&tls).is_err());
    }
}
