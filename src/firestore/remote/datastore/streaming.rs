use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use serde::de::DeserializeOwned;

use super::{
    BatchGetResponse, CommitResponse, Datastore, StreamHandle, StreamingDatastore, StreamingFuture,
    UnaryRequest,
};
use crate::firestore::error::{internal_error, unavailable, FirestoreResult};
use crate::firestore::model::{DocumentKey, MutableDocument, Mutation};
use crate::firestore::remote::network::StreamCredentials;
use crate::firestore::remote::stream::{MultiplexedConnection, MultiplexedStream, StreamMetadata};

pub(crate) fn box_stream_future<'a, F, T>(future: F) -> StreamingFuture<'a, T>
where
    F: std::future::Future<Output = T> + Send + 'a,
{
    future.boxed()
}

fn metadata_for(method: &str, credentials: StreamCredentials) -> StreamMetadata {
    StreamMetadata {
        method: method.to_string(),
        auth_token: credentials.auth_token,
        app_check_token: credentials.app_check_token,
    }
}

/// Datastore speaking JSON frames over a [`MultiplexedConnection`].
pub struct StreamingDatastoreImpl {
    connection: Arc<MultiplexedConnection>,
}

impl StreamingDatastoreImpl {
    pub fn new(connection: Arc<MultiplexedConnection>) -> Self {
        Self { connection }
    }

    fn open(
        &self,
        method: &'static str,
        credentials: StreamCredentials,
    ) -> StreamingFuture<'_, FirestoreResult<Arc<dyn StreamHandle>>> {
        let connection = Arc::clone(&self.connection);
        box_stream_future(async move {
            let stream = connection
                .open_stream(metadata_for(method, credentials))
                .await?;
            Ok(Arc::new(StreamingHandleImpl::new(stream)) as Arc<dyn StreamHandle>)
        })
    }

    /// Sends one request on a fresh stream and reads exactly one reply.
    async fn unary<R>(&self, method: &str, request: &UnaryRequest, credentials: StreamCredentials) -> FirestoreResult<R>
    where
        R: DeserializeOwned,
    {
        let payload = serde_json::to_vec(request)
            .map_err(|err| internal_error(format!("failed to encode {method} request: {err}")))?;
        let stream = self
            .connection
            .open_stream(metadata_for(method, credentials))
            .await?;
        stream.send(payload).await?;
        let reply = match stream.next().await {
            Some(reply) => reply?,
            None => return Err(unavailable(format!("{method} stream closed without a response"))),
        };
        let _ = stream.close().await;
        serde_json::from_slice(&reply)
            .map_err(|err| internal_error(format!("failed to decode {method} response: {err}")))
    }
}

impl StreamingDatastore for StreamingDatastoreImpl {
    fn open_listen_stream(
        &self,
        credentials: StreamCredentials,
    ) -> StreamingFuture<'_, FirestoreResult<Arc<dyn StreamHandle>>> {
        self.open("listen", credentials)
    }

    fn open_write_stream(
        &self,
        credentials: StreamCredentials,
    ) -> StreamingFuture<'_, FirestoreResult<Arc<dyn StreamHandle>>> {
        self.open("write", credentials)
    }
}

#[async_trait]
impl Datastore for StreamingDatastoreImpl {
    async fn commit(
        &self,
        mutations: Vec<Mutation>,
        credentials: StreamCredentials,
    ) -> FirestoreResult<CommitResponse> {
        let request = UnaryRequest::Commit { writes: mutations };
        self.unary("commit", &request, credentials).await
    }

    async fn batch_get_documents(
        &self,
        keys: Vec<DocumentKey>,
        credentials: StreamCredentials,
    ) -> FirestoreResult<Vec<MutableDocument>> {
        let request = UnaryRequest::BatchGet {
            documents: keys.clone(),
        };
        let response: BatchGetResponse = self.unary("batchGet", &request, credentials).await?;
        response.into_documents(&keys)
    }
}

pub struct StreamingHandleImpl {
    stream: MultiplexedStream,
}

impl StreamingHandleImpl {
    fn new(stream: MultiplexedStream) -> Self {
        Self { stream }
    }
}

impl StreamHandle for StreamingHandleImpl {
    fn send(&self, payload: Vec<u8>) -> StreamingFuture<'_, FirestoreResult<()>> {
        let stream = &self.stream;
        box_stream_future(async move { stream.send(payload).await })
    }

    fn next(&self) -> StreamingFuture<'_, Option<FirestoreResult<Vec<u8>>>> {
        let stream = &self.stream;
        box_stream_future(async move { stream.next().await })
    }

    fn close(&self) -> StreamingFuture<'_, FirestoreResult<()>> {
        let stream = &self.stream;
        box_stream_future(async move { stream.close().await })
    }
}
