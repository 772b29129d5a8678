//! Connection-facing adapter surface
//!
//! The wire layer owns sockets and MQTT framing; this module owns everything
//! behind them. Each inbound packet maps to one `Adapter` method, called with
//! the `SessionHandle` issued at CONNECT. Outbound traffic flows through the
//! `DeliverySink` the wire layer registers per connection.
//!
//! Handles are stamped with the session epoch. When a second CONNECT takes
//! over a client id, the old connection's handle goes stale: its operations
//! fail with a protocol violation and its disconnect becomes a no-op.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::amqp::AmqpBackend;
use crate::bridge::QosBridge;
use crate::config::AdapterConfig;
use crate::error::{AdapterError, LossCause};
use crate::protocol::{OutboundMessage, QoS, WillMessage};
use crate::retain::RetainStore;
use crate::session::{Session, SessionRegistry};
use crate::topic::{validate_topic_filter, validate_topic_name};

/// Where the adapter pushes traffic for one connection
#[async_trait]
pub trait DeliverySink: Send + Sync {
    /// Transmit a message to the client
    ///
    /// An error means the message could not be handed to the transport; the
    /// adapter will not acknowledge it and will close the connection.
    async fn deliver(&self, msg: OutboundMessage) -> Result<(), AdapterError>;

    /// The adapter closed the connection from its side
    fn connection_lost(&self, cause: LossCause);
}

/// Everything a CONNECT packet carries that the engine cares about
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub client_id: String,
    pub clean_session: bool,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
    pub will: Option<WillMessage>,
}

/// Capability to act on behalf of one accepted connection
#[derive(Debug, Clone)]
pub struct SessionHandle {
    client_id: Arc<str>,
    epoch: u64,
}

impl SessionHandle {
    pub fn client_id(&self) -> &str {
        &self.client_id
    }
}

/// The session and subscription engine
pub struct Adapter {
    backend: Arc<dyn AmqpBackend>,
    registry: SessionRegistry,
    bridge: QosBridge,
}

impl Adapter {
    pub fn new(backend: Arc<dyn AmqpBackend>, config: AdapterConfig) -> Self {
        let retained = Arc::new(RetainStore::new());
        let bridge = QosBridge::new(backend.clone(), retained, config.amqp.exchange.clone());
        Self {
            backend,
            registry: SessionRegistry::new(config.session.expiry),
            bridge,
        }
    }

    /// Accept a connection: authenticate, evict any holder of the client id,
    /// and set up (or resume) the session
    pub async fn on_connect(
        &self,
        opts: ConnectOptions,
        sink: Arc<dyn DeliverySink>,
    ) -> Result<SessionHandle, AdapterError> {
        if opts.client_id.is_empty() {
            return Err(AdapterError::ProtocolViolation("empty client id"));
        }

        self.backend
            .authenticate(opts.username.as_deref(), opts.password.as_deref())
            .await?;

        // Registering first makes the takeover atomic: whichever of two
        // racing CONNECTs inserts last wins, and the loser's session comes
        // back as the displaced one to evict
        let (session, displaced) = self
            .registry
            .create(&opts.client_id, opts.clean_session, sink);
        if let Some(existing) = displaced {
            info!("evicting existing connection for {}", opts.client_id);
            self.evict(&existing).await;
        }

        if opts.clean_session {
            // A clean connect starts from nothing, including queues a
            // previous persistent session may have left behind
            self.bridge.remove_queues(&opts.client_id).await;
        }

        session.read().will.arm(opts.will);

        if !opts.clean_session {
            self.bridge.resume(&session).await?;
        }

        let (client_id, epoch) = {
            let s = session.read();
            (s.client_id.clone(), s.epoch)
        };
        info!("client {} connected (clean={})", client_id, opts.clean_session);
        Ok(SessionHandle { client_id, epoch })
    }

    /// Grant a subscription and deliver matching retained messages
    pub async fn on_subscribe(
        &self,
        handle: &SessionHandle,
        filter: &str,
        qos: QoS,
    ) -> Result<QoS, AdapterError> {
        validate_topic_filter(filter).map_err(AdapterError::ProtocolViolation)?;
        let session = self.resolve(handle)?;
        let spec = self.registry.queue_spec(session.read().clean_session);
        self.bridge.subscribe(&session, filter, qos, spec).await
    }

    pub async fn on_unsubscribe(
        &self,
        handle: &SessionHandle,
        filter: &str,
    ) -> Result<(), AdapterError> {
        validate_topic_filter(filter).map_err(AdapterError::ProtocolViolation)?;
        let session = self.resolve(handle)?;
        self.bridge.unsubscribe(&session, filter).await
    }

    /// Route an inbound PUBLISH
    ///
    /// Returns once the message is routed; for QoS 1 the caller can then send
    /// PUBACK to the publisher.
    pub async fn on_publish(
        &self,
        handle: &SessionHandle,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<(), AdapterError> {
        validate_topic_name(topic).map_err(AdapterError::ProtocolViolation)?;
        self.resolve(handle)?;
        self.bridge.publish(topic, payload, qos, retain).await
    }

    /// Resolve the client's PUBACK for an outbound QoS 1 delivery
    pub async fn on_puback(
        &self,
        handle: &SessionHandle,
        delivery_id: u64,
    ) -> Result<(), AdapterError> {
        let session = self.resolve(handle)?;
        self.bridge.ack(&session, delivery_id).await
    }

    /// Tear down the connection
    ///
    /// Graceful disconnects disarm the will; ungraceful ones fire it. A stale
    /// handle (the connection was already taken over) is a no-op.
    pub async fn on_disconnect(
        &self,
        handle: &SessionHandle,
        graceful: bool,
    ) -> Result<(), AdapterError> {
        let Ok(session) = self.resolve(handle) else {
            return Ok(());
        };

        if graceful {
            session.read().will.disarm();
        } else {
            self.bridge.fire_will(&session).await;
        }

        self.bridge.detach(&session).await;
        self.registry.remove_if_epoch(&handle.client_id, handle.epoch);
        if session.read().clean_session {
            self.bridge.remove_queues(&handle.client_id).await;
        }
        debug!("client {} disconnected (graceful={})", handle.client_id, graceful);
        Ok(())
    }

    /// Number of sessions currently registered
    pub fn session_count(&self) -> usize {
        self.registry.len()
    }

    fn resolve(&self, handle: &SessionHandle) -> Result<Arc<RwLock<Session>>, AdapterError> {
        let session = self
            .registry
            .get(&handle.client_id)
            .ok_or(AdapterError::ProtocolViolation("no such session"))?;
        if session.read().epoch != handle.epoch {
            return Err(AdapterError::ProtocolViolation("stale session handle"));
        }
        Ok(session)
    }

    /// Full ungraceful close on behalf of a superseded connection
    async fn evict(&self, session: &Arc<RwLock<Session>>) {
        self.bridge.fire_will(session).await;
        self.bridge.detach(session).await;

        let (client_id, clean, sink) = {
            let s = session.read();
            (s.client_id.clone(), s.clean_session, s.sink.clone())
        };
        if clean {
            self.bridge.remove_queues(&client_id).await;
        }
        sink.connection_lost(LossCause::SessionTakenOver);
    }
}
