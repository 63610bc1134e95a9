use std::sync::Arc;
use std::time::Duration;

use crate::firestore::error::{FirestoreErrorCode, FirestoreResult};
use crate::firestore::model::{DocumentKey, MutableDocument, Mutation};
use crate::firestore::remote::credentials::{NoopTokenProvider, TokenProviderArc};
use crate::firestore::remote::datastore::{
    CommitResponse, Datastore, StreamHandle, StreamingDatastore,
};
use crate::firestore::remote::stream::StreamKind;
use crate::util::backoff::BackoffConfig;

/// Streams close after this long without pending work.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StreamCredentials {
    pub auth_token: Option<String>,
    pub app_check_token: Option<String>,
}

#[derive(Clone)]
struct StreamCredentialProvider {
    auth_provider: TokenProviderArc,
    app_check_provider: TokenProviderArc,
}

impl StreamCredentialProvider {
    async fn fetch(&self) -> FirestoreResult<StreamCredentials> {
        let auth_token = self.auth_provider.get_token().await?;
        let app_check_token = self.app_check_provider.get_token().await?;
        Ok(StreamCredentials {
            auth_token,
            app_check_token,
        })
    }

    fn invalidate(&self) {
        self.auth_provider.invalidate_token();
        self.app_check_provider.invalidate_token();
    }
}

/// Everything the remote layer needs to reach the backend: the datastore,
/// the token providers and the stream timing settings.
#[derive(Clone)]
pub struct NetworkLayer {
    streaming: Arc<dyn StreamingDatastore>,
    datastore: Arc<dyn Datastore>,
    credentials: StreamCredentialProvider,
    backoff: BackoffConfig,
    idle_timeout: Duration,
}

impl NetworkLayer {
    pub fn builder<D>(datastore: Arc<D>, auth_provider: TokenProviderArc) -> NetworkLayerBuilder
    where
        D: StreamingDatastore + Datastore,
    {
        NetworkLayerBuilder::new(datastore.clone(), datastore, auth_provider)
    }

    pub fn auth_provider(&self) -> &TokenProviderArc {
        &self.credentials.auth_provider
    }

    pub fn backoff(&self) -> &BackoffConfig {
        &self.backoff
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    pub async fn fetch_credentials(&self) -> FirestoreResult<StreamCredentials> {
        self.credentials.fetch().await
    }

    /// Makes the next credential fetch hit the token providers again.
    pub fn invalidate_credentials(&self) {
        self.credentials.invalidate();
    }

    pub(crate) async fn open_stream(&self, kind: StreamKind) -> FirestoreResult<Arc<dyn StreamHandle>> {
        let credentials = self.fetch_credentials().await?;
        match kind {
            StreamKind::Listen => self.streaming.open_listen_stream(credentials).await,
            StreamKind::Write => self.streaming.open_write_stream(credentials).await,
        }
    }

    /// Commits `mutations` in one unary call, outside the write pipeline.
    pub async fn commit(&self, mutations: Vec<Mutation>) -> FirestoreResult<CommitResponse> {
        let credentials = self.fetch_credentials().await?;
        let result = self.datastore.commit(mutations, credentials).await;
        self.observe(result)
    }

    pub async fn batch_get_documents(&self, keys: Vec<DocumentKey>) -> FirestoreResult<Vec<MutableDocument>> {
        let credentials = self.fetch_credentials().await?;
        let result = self.datastore.batch_get_documents(keys, credentials).await;
        self.observe(result)
    }

    fn observe<T>(&self, result: FirestoreResult<T>) -> FirestoreResult<T> {
        if let Err(err) = &result {
            if err.code == FirestoreErrorCode::Unauthenticated {
                self.invalidate_credentials();
            }
        }
        result
    }
}

pub struct NetworkLayerBuilder {
    streaming: Arc<dyn StreamingDatastore>,
    datastore: Arc<dyn Datastore>,
    auth_provider: TokenProviderArc,
    app_check_provider: Option<TokenProviderArc>,
    backoff: BackoffConfig,
    idle_timeout: Duration,
}

impl NetworkLayerBuilder {
    fn new(
        streaming: Arc<dyn StreamingDatastore>,
        datastore: Arc<dyn Datastore>,
        auth_provider: TokenProviderArc,
    ) -> Self {
        Self {
            streaming,
            datastore,
            auth_provider,
            app_check_provider: None,
            backoff: BackoffConfig::default(),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }

    pub fn with_app_check_provider(mut self, provider: TokenProviderArc) -> Self {
        self.app_check_provider = Some(provider);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn build(self) -> NetworkLayer {
        let app_check_provider = self
            .app_check_provider
            .unwrap_or_else(|| Arc::new(NoopTokenProvider) as TokenProviderArc);
        NetworkLayer {
            streaming: self.streaming,
            datastore: self.datastore,
            credentials: StreamCredentialProvider {
                auth_provider: self.auth_provider,
                app_check_provider,
            },
            backoff: self.backoff,
            idle_timeout: self.idle_timeout,
        }
    }
}
