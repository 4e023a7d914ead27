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

//! Pull based batching of allocation requests over a single stream.
//!
//! Clients open a `StreamBatches` stream and register with their first
//! message. The processor then periodically asks every client for its
//! pending requests with a pull message, allocates the batch it receives and
//! answers with a batch response carrying one result per request id.

use std::{pin::Pin, sync::Arc, time::Duration};

use dashmap::DashMap;
use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tonic::{transport::Channel, Status};

use super::{convert, Allocator};
use crate::{
    generated::allocation::{
        processor_client::ProcessorClient,
        processor_message::Payload,
        processor_server::Processor,
        response_wrapper, AllocationRequest, AllocationResponse, BatchRequest, BatchResponse,
        ErrorStatus, ProcessorMessage, PullRequest, RequestWrapper, ResponseWrapper,
    },
    signal::ShutdownRx,
};

const OUTBOUND_CAPACITY: usize = 16;

type MessageStream = Pin<Box<dyn Stream<Item = Result<ProcessorMessage, Status>> + Send>>;

/// The processor end of `StreamBatches`.
pub struct ProcessorService {
    allocator: Arc<Allocator>,
    pull_interval: Duration,
    shutdown: ShutdownRx,
}

impl ProcessorService {
    pub fn new(allocator: Arc<Allocator>, pull_interval: Duration, shutdown: ShutdownRx) -> Self {
        Self {
            allocator,
            pull_interval,
            shutdown,
        }
    }
}

#[tonic::async_trait]
impl Processor for ProcessorService {
    type StreamBatchesStream = MessageStream;

    async fn stream_batches(
        &self,
        request: tonic::Request<tonic::Streaming<ProcessorMessage>>,
    ) -> Result<tonic::Response<Self::StreamBatchesStream>, Status> {
        let mut inbound = request.into_inner();
        let client_id = match inbound.message().await? {
            Some(message) if !message.client_id.is_empty() => message.client_id,
            _ => {
                tracing::warn!("client registered without an id, closing stream");
                return Ok(tonic::Response::new(Box::pin(tokio_stream::empty())));
            }
        };

        tracing::debug!(%client_id, "processor client registered");
        let (outbound, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        tokio::spawn(serve_client(
            self.allocator.clone(),
            client_id,
            inbound,
            outbound,
            self.pull_interval,
            self.shutdown.clone(),
        ));

        Ok(tonic::Response::new(Box::pin(ReceiverStream::new(rx))))
    }
}

#[tracing::instrument(skip_all, fields(%client_id))]
async fn serve_client(
    allocator: Arc<Allocator>,
    client_id: String,
    mut inbound: tonic::Streaming<ProcessorMessage>,
    outbound: mpsc::Sender<Result<ProcessorMessage, Status>>,
    pull_interval: Duration,
    mut shutdown: ShutdownRx,
) {
    let mut pull = tokio::time::interval(pull_interval);
    pull.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        let message = tokio::select! {
            _ = shutdown.changed() => return,
            _ = outbound.closed() => return,
            _ = pull.tick() => {
                let pull = ProcessorMessage {
                    client_id: client_id.clone(),
                    payload: Some(Payload::Pull(PullRequest { message: "pull".into() })),
                };
                if outbound.send(Ok(pull)).await.is_err() {
                    return;
                }
                continue;
            }
            message = inbound.message() => message,
        };

        let batch = match message {
            Ok(Some(ProcessorMessage {
                payload: Some(Payload::BatchRequest(batch)),
                ..
            })) => batch,
            Ok(Some(_)) => {
                tracing::debug!("ignoring message without a batch");
                continue;
            }
            Ok(None) => return,
            Err(error) => {
                tracing::debug!(%error, "processor stream ended");
                return;
            }
        };

        let batch_id = batch.batch_id.clone();
        let count = batch.requests.len();
        let response = allocate_batch(&allocator, batch).await;
        tracing::debug!(%batch_id, count, "batch allocated");

        let message = ProcessorMessage {
            client_id: client_id.clone(),
            payload: Some(Payload::BatchResponse(response)),
        };
        if outbound.send(Ok(message)).await.is_err() {
            return;
        }
    }
}

/// Allocates every request of `batch` concurrently.
async fn allocate_batch(allocator: &Allocator, batch: BatchRequest) -> BatchResponse {
    let responses = futures::future::join_all(batch.requests.into_iter().map(
        |RequestWrapper {
             request_id,
             request,
         }| async move {
            let result = match request {
                Some(request) => {
                    convert::to_result(allocator.allocate(convert::to_allocation(request)).await)
                }
                None => response_wrapper::Result::Error(ErrorStatus {
                    code: tonic::Code::InvalidArgument as i32,
                    message: "missing request".into(),
                }),
            };

            ResponseWrapper {
                request_id,
                result: Some(result),
            }
        },
    ))
    .await;

    BatchResponse {
        batch_id: batch.batch_id,
        responses,
    }
}

type Waiting = oneshot::Sender<Result<AllocationResponse, Status>>;

/// The client end of `StreamBatches`. Requests accumulate in a hot batch
/// that is sent whenever the processor pulls.
pub struct BatchClient {
    client_id: String,
    hot: Mutex<Vec<RequestWrapper>>,
    waiting: DashMap<String, Waiting>,
    timeout: Duration,
}

impl BatchClient {
    /// A client with a random id when `client_id` is empty.
    pub fn new(client_id: impl Into<String>, timeout: Duration) -> Arc<Self> {
        let client_id = client_id.into();
        let client_id = if client_id.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            client_id
        };

        Arc::new(Self {
            client_id,
            hot: <_>::default(),
            waiting: <_>::default(),
            timeout,
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Queues `request` for the next pull and waits for its result.
    pub async fn allocate(&self, request: AllocationRequest) -> Result<AllocationResponse, Status> {
        let request_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.waiting.insert(request_id.clone(), tx);
        self.hot.lock().push(RequestWrapper {
            request_id: request_id.clone(),
            request: Some(request),
        });

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Status::unavailable("processor client stopped")),
            Err(_) => {
                self.waiting.remove(&request_id);
                self.hot.lock().retain(|wrapper| wrapper.request_id != request_id);
                Err(Status::deadline_exceeded(format!(
                    "allocation timeout after {:?}",
                    self.timeout
                )))
            }
        }
    }

    /// Registers over `channel` and answers pulls until the stream ends or
    /// `shutdown` fires.
    #[tracing::instrument(skip_all, fields(client_id = %self.client_id))]
    pub async fn run(self: Arc<Self>, channel: Channel, mut shutdown: ShutdownRx) -> Result<(), Status> {
        let (outbound, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let register = ProcessorMessage {
            client_id: self.client_id.clone(),
            payload: None,
        };
        outbound
            .send(register)
            .await
            .map_err(|_| Status::internal("processor stream closed"))?;

        let mut inbound = ProcessorClient::new(channel)
            .stream_batches(ReceiverStream::new(rx))
            .await?
            .into_inner();
        tracing::info!("connected to processor");

        loop {
            let message = tokio::select! {
                _ = shutdown.changed() => return Ok(()),
                message = inbound.message() => message?,
            };

            match message.and_then(|message| message.payload) {
                Some(Payload::Pull(_)) => self.send_batch(&outbound).await,
                Some(Payload::BatchResponse(response)) => self.complete(response),
                Some(Payload::BatchRequest(_)) => {
                    tracing::warn!("unexpected batch request from processor");
                }
                None => return Ok(()),
            }
        }
    }

    async fn send_batch(&self, outbound: &mpsc::Sender<ProcessorMessage>) {
        let requests = std::mem::take(&mut *self.hot.lock());
        if requests.is_empty() {
            return;
        }

        let batch = BatchRequest {
            batch_id: uuid::Uuid::new_v4().to_string(),
            requests,
        };
        let message = ProcessorMessage {
            client_id: self.client_id.clone(),
            payload: Some(Payload::BatchRequest(batch)),
        };

        if let Err(mpsc::error::SendError(message)) = outbound.send(message).await {
            tracing::warn!("failed to send batch, requeueing");
            if let Some(Payload::BatchRequest(batch)) = message.payload {
                self.hot.lock().extend(batch.requests);
            }
        }
    }

    fn complete(&self, response: BatchResponse) {
        for ResponseWrapper { request_id, result } in response.responses {
            match self.waiting.remove(&request_id) {
                Some((_, waiting)) => {
                    let _ = waiting.send(convert::from_result(result));
                }
                None => {
                    tracing::debug!(%request_id, batch_id = %response.batch_id, "no caller waiting for response");
                }
            }
        }
    }
}
