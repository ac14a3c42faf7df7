//! One-time, concurrency-safe start of the bus engine.
//!
//! The function host gives no startup hook, so the engine is started by the
//! first invocation that needs it. A tri-state flag is read without locking
//! on the fast path; callers that see it unset queue on the start gate, and
//! only the first one through performs the start. A failed start puts the
//! flag back to `NotStarted` so the next call tries again.

use crate::config::EndpointConfiguration;
use crate::engine::{BusEngine, MessageSession, ServiceRegistry};
use crate::errors::BusError;
use crate::logging::LoggerContext;
use crate::processor::PipelineInvoker;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Start state of a [`LazyEndpoint`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StartState {
    NotStarted = 0,
    Starting = 1,
    Started = 2,
}

impl StartState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => StartState::NotStarted,
            1 => StartState::Starting,
            _ => StartState::Started,
        }
    }
}

/// The started engine instance together with its message processor.
pub struct EndpointHandle {
    session: Arc<dyn MessageSession>,
    processor: Arc<PipelineInvoker>,
}

impl EndpointHandle {
    pub fn session(&self) -> &Arc<dyn MessageSession> {
        &self.session
    }

    pub fn processor(&self) -> &Arc<PipelineInvoker> {
        &self.processor
    }
}

impl fmt::Debug for EndpointHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointHandle")
            .field("processor", &self.processor)
            .finish()
    }
}

/// Starts the engine on first use and shares the result afterwards.
pub struct LazyEndpoint {
    engine: Arc<dyn BusEngine>,
    configuration: EndpointConfiguration,
    registry: ServiceRegistry,
    logging: Arc<LoggerContext>,
    state: AtomicU8,
    gate: Mutex<()>,
    handle: OnceLock<Arc<EndpointHandle>>,
}

impl LazyEndpoint {
    pub fn new(
        engine: Arc<dyn BusEngine>,
        configuration: EndpointConfiguration,
        registry: ServiceRegistry,
        logging: Arc<LoggerContext>,
    ) -> Self {
        Self {
            engine,
            configuration,
            registry,
            logging,
            state: AtomicU8::new(StartState::NotStarted as u8),
            gate: Mutex::new(()),
            handle: OnceLock::new(),
        }
    }

    pub fn state(&self) -> StartState {
        StartState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn configuration(&self) -> &EndpointConfiguration {
        &self.configuration
    }

    /// Start the engine unless already started, and return the shared handle.
    ///
    /// Safe to call from any number of concurrent invocations; the engine is
    /// started at most once. Waiting for the start gate observes `cancel`.
    pub async fn ensure_started(
        &self,
        cancel: &CancellationToken,
    ) -> crate::Result<Arc<EndpointHandle>> {
        if let Some(handle) = self.started_handle() {
            return Ok(handle);
        }

        let _gate = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(BusError::Cancelled),
            guard = self.gate.lock() => guard,
        };

        if let Some(handle) = self.started_handle() {
            return Ok(handle);
        }

        self.state
            .store(StartState::Starting as u8, Ordering::Release);
        tracing::info!(
            endpoint = %self.configuration.endpoint_name,
            send_only = self.configuration.send_only,
            "starting endpoint"
        );

        let started = match self
            .engine
            .start(&self.configuration, &self.registry, &self.logging)
            .await
        {
            Ok(started) => started,
            Err(e) => {
                self.state
                    .store(StartState::NotStarted as u8, Ordering::Release);
                tracing::error!(
                    endpoint = %self.configuration.endpoint_name,
                    error = %e,
                    "endpoint start failed"
                );
                return Err(match e {
                    BusError::Startup(_) | BusError::Cancelled => e,
                    other => BusError::Startup(Box::new(other)),
                });
            }
        };

        let processor = match (self.configuration.send_only, started.pipeline) {
            (false, Some(pipeline)) => PipelineInvoker::bound(pipeline),
            _ => PipelineInvoker::send_only(),
        };
        let handle = Arc::new(EndpointHandle {
            session: started.session,
            processor: Arc::new(processor),
        });

        // Only reachable once: the flag below is set right after and every
        // later caller returns through `started_handle`.
        let handle = self.handle.get_or_init(|| handle).clone();
        self.state.store(StartState::Started as u8, Ordering::Release);

        tracing::info!(endpoint = %self.configuration.endpoint_name, "endpoint started");
        Ok(handle)
    }

    fn started_handle(&self) -> Option<Arc<EndpointHandle>> {
        if self.state() == StartState::Started {
            self.handle.get().cloned()
        } else {
            None
        }
    }
}

impl fmt::Debug for LazyEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyEndpoint")
            .field("endpoint", &self.configuration.endpoint_name)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(all(test, feature = "testing"))]
mod tests {
    use super::*;
    use crate::config::MapSource;
    use crate::engine::StartedEndpoint;
    use crate::testing::InMemoryTransport;
    use std::sync::atomic::AtomicUsize;

    struct FlakyEngine {
        starts: AtomicUsize,
        fail_first: bool,
        transport: InMemoryTransport,
    }

    #[async_trait::async_trait]
    impl BusEngine for FlakyEngine {
        async fn start(
            &self,
            configuration: &EndpointConfiguration,
            _registry: &ServiceRegistry,
            _logging: &Arc<LoggerContext>,
        ) -> crate::Result<StartedEndpoint> {
            let n = self.starts.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            if self.fail_first && n == 0 {
                return Err(BusError::Transport("namespace unreachable".into()));
            }
            Ok(StartedEndpoint {
                pipeline: None,
                session: Arc::new(
                    self.transport
                        .session(&configuration.endpoint_name, Default::default()),
                ),
            })
        }
    }

    fn lazy(engine: Arc<FlakyEngine>) -> LazyEndpoint {
        let configuration = EndpointConfiguration::builder()
            .source(MapSource::new())
            .endpoint_name("lazy")
            .send_only(true)
            .build()
            .unwrap();
        LazyEndpoint::new(
            engine,
            configuration,
            ServiceRegistry::new(),
            Arc::new(LoggerContext::new()),
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_start_once() {
        let engine = Arc::new(FlakyEngine {
            starts: AtomicUsize::new(0),
            fail_first: false,
            transport: InMemoryTransport::new(),
        });
        let lazy = Arc::new(lazy(engine.clone()));

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..16 {
            let lazy = lazy.clone();
            tasks.spawn(async move { lazy.ensure_started(&CancellationToken::new()).await });
        }

        let mut handles = Vec::new();
        while let Some(result) = tasks.join_next().await {
            handles.push(result.unwrap().unwrap());
        }

        assert_eq!(engine.starts.load(Ordering::SeqCst), 1);
        assert_eq!(lazy.state(), StartState::Started);
        assert!(handles.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }

    #[tokio::test]
    async fn test_failed_start_is_retried() {
        let engine = Arc::new(FlakyEngine {
            starts: AtomicUsize::new(0),
            fail_first: true,
            transport: InMemoryTransport::new(),
        });
        let lazy = lazy(engine.clone());
        let cancel = CancellationToken::new();

        let err = lazy.ensure_started(&cancel).await.unwrap_err();
        assert!(matches!(err, BusError::Startup(_)));
        assert_eq!(lazy.state(), StartState::NotStarted);

        let handle = lazy.ensure_started(&cancel).await.unwrap();
        assert!(handle.processor().is_send_only());
        assert_eq!(engine.starts.load(Ordering::SeqCst), 2);
        assert_eq!(lazy.state(), StartState::Started);
    }

    #[tokio::test]
    async fn test_cancelled_before_gate() {
        let engine = Arc::new(FlakyEngine {
            starts: AtomicUsize::new(0),
            fail_first: false,
            transport: InMemoryTransport::new(),
        });
        let lazy = lazy(engine.clone());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = lazy.ensure_started(&cancel).await.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(engine.starts.load(Ordering::SeqCst), 0);
    }
}
