//! QoS bridge between MQTT delivery semantics and broker queues
//!
//! Each session gets at most two queues, one per QoS level. A subscription is
//! a binding from the exchange to the queue of its granted level, so the
//! `min(subscription, publish)` downgrade falls out of which queue a message
//! lands in: the QoS 0 queue is consumed without acknowledgement and always
//! delivers at QoS 0, while the QoS 1 queue delivers at the publish QoS and
//! acknowledges QoS 0 messages on the client's behalf.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};

use crate::amqp::{AmqpBackend, AmqpError, ConsumerTag, Delivery, MessageProperties, QueueSpec};
use crate::error::{AdapterError, LossCause};
use crate::protocol::{OutboundMessage, QoS};
use crate::retain::RetainStore;
use crate::session::{subscription_queue_name, AckTarget, Session};
use crate::topic::{from_routing_key, to_binding_pattern, to_routing_key};

/// Routes publishes into the exchange and session queues out to sinks
pub struct QosBridge {
    backend: Arc<dyn AmqpBackend>,
    retained: Arc<RetainStore>,
    exchange: String,
}

impl QosBridge {
    pub fn new(backend: Arc<dyn AmqpBackend>, retained: Arc<RetainStore>, exchange: String) -> Self {
        Self {
            backend,
            retained,
            exchange,
        }
    }

    /// Publish into the exchange, updating the retained store first
    ///
    /// QoS 1 publishes wait for the publisher confirm before returning, so the
    /// caller can send PUBACK knowing the broker has routed the message.
    pub async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<(), AdapterError> {
        if retain {
            self.retained.set(topic, payload.clone(), qos);
        }

        let props = MessageProperties {
            qos,
            retained: retain,
        };
        let confirm = qos == QoS::AtLeastOnce;
        self.backend
            .publish(&self.exchange, &to_routing_key(topic), payload, props, confirm)
            .await?;
        trace!("published to {} at qos {}", topic, qos as u8);
        Ok(())
    }

    /// Install a subscription and deliver matching retained messages
    ///
    /// Returns the granted QoS. Changing the QoS of an existing filter moves
    /// its binding to the other level's queue; repeating an identical
    /// subscription only re-delivers retained messages.
    pub async fn subscribe(
        &self,
        session: &Arc<RwLock<Session>>,
        filter: &str,
        requested: QoS,
        spec: QueueSpec,
    ) -> Result<QoS, AdapterError> {
        let granted = requested;
        let client_id = session.read().client_id.clone();

        let queue = subscription_queue_name(&client_id, granted);
        let pattern = to_binding_pattern(filter);

        self.backend.declare_queue(&queue, spec).await?;
        self.backend
            .bind_queue(&queue, &self.exchange, &pattern)
            .await?;

        // A filter lives on exactly one queue. The other level may hold a
        // binding from an earlier subscribe, possibly from before a
        // reconnect, so this does not consult the in-memory subscription map.
        let other = match granted {
            QoS::AtMostOnce => QoS::AtLeastOnce,
            QoS::AtLeastOnce => QoS::AtMostOnce,
        };
        let other_queue = subscription_queue_name(&client_id, other);
        self.backend
            .unbind_queue(&other_queue, &self.exchange, &pattern)
            .await?;

        self.ensure_consumer(session, &queue, granted).await?;
        session.write().set_subscription(filter, granted);
        debug!("{} subscribed to {} at qos {}", client_id, filter, granted as u8);

        // Retained messages go straight to the sink, capped at the granted QoS
        for retained in self.retained.matching(filter) {
            let qos = retained.qos.min(granted);
            let delivery_id = match qos {
                QoS::AtLeastOnce => Some(session.write().record_pending(AckTarget::Local)),
                QoS::AtMostOnce => None,
            };
            let sink = session.read().sink.clone();
            let msg = OutboundMessage {
                topic: retained.topic,
                qos,
                payload: retained.payload,
                delivery_id,
            };
            if sink.deliver(msg).await.is_err() {
                // Nothing will ever acknowledge this delivery; drop its
                // pending entry along with the failed send
                if let Some(id) = delivery_id {
                    session.write().take_pending(id);
                }
                return Err(AdapterError::Delivery);
            }
        }

        Ok(granted)
    }

    /// Drop a subscription's binding; the queue and consumer stay in place,
    /// so messages already enqueued still drain
    pub async fn unsubscribe(
        &self,
        session: &Arc<RwLock<Session>>,
        filter: &str,
    ) -> Result<(), AdapterError> {
        let client_id = {
            let mut s = session.write();
            s.remove_subscription(filter);
            s.client_id.clone()
        };

        // Either level's queue may hold the binding, including one installed
        // before a reconnect, so both are unbound without consulting the
        // in-memory subscription map
        let pattern = to_binding_pattern(filter);
        for level in [QoS::AtMostOnce, QoS::AtLeastOnce] {
            let queue = subscription_queue_name(&client_id, level);
            self.backend
                .unbind_queue(&queue, &self.exchange, &pattern)
                .await?;
        }
        debug!("{} unsubscribed from {}", client_id, filter);
        Ok(())
    }

    /// Reattach consumers to whatever session queues survived a disconnect
    pub async fn resume(&self, session: &Arc<RwLock<Session>>) -> Result<(), AdapterError> {
        let client_id = session.read().client_id.clone();
        for level in [QoS::AtMostOnce, QoS::AtLeastOnce] {
            let queue = subscription_queue_name(&client_id, level);
            match self.ensure_consumer(session, &queue, level).await {
                Ok(()) => {}
                Err(AdapterError::Amqp(AmqpError::QueueNotFound(_))) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Resolve a PUBACK from the client
    pub async fn ack(
        &self,
        session: &Arc<RwLock<Session>>,
        delivery_id: u64,
    ) -> Result<(), AdapterError> {
        let target = session
            .write()
            .take_pending(delivery_id)
            .ok_or(AdapterError::ProtocolViolation("unknown delivery id"))?;

        if let AckTarget::Broker {
            queue,
            delivery_tag,
        } = target
        {
            self.backend.ack(&queue, delivery_tag).await?;
        }
        Ok(())
    }

    /// Cancel every consumer the session holds
    ///
    /// Unacknowledged messages stay queued for redelivery; auto-delete queues
    /// vanish with their consumer.
    pub async fn detach(&self, session: &Arc<RwLock<Session>>) {
        let tags: Vec<ConsumerTag> = std::mem::take(&mut session.write().consumers);
        for tag in tags {
            if let Err(e) = self.backend.cancel(&tag).await {
                warn!("cancel failed for {}: {}", tag.queue, e);
            }
        }
    }

    /// Delete both session queues (clean-session teardown)
    pub async fn remove_queues(&self, client_id: &str) {
        for level in [QoS::AtMostOnce, QoS::AtLeastOnce] {
            let queue = subscription_queue_name(client_id, level);
            if let Err(e) = self.backend.delete_queue(&queue).await {
                warn!("delete failed for {}: {}", queue, e);
            }
        }
    }

    /// Publish the session's will, if still armed
    pub async fn fire_will(&self, session: &Arc<RwLock<Session>>) {
        let will = session.read().will.take();
        if let Some(will) = will {
            debug!("firing will for {}", session.read().client_id);
            if let Err(e) = self
                .publish(&will.topic, will.payload, will.qos, will.retain)
                .await
            {
                error!("will publish failed: {}", e);
            }
        }
    }

    async fn ensure_consumer(
        &self,
        session: &Arc<RwLock<Session>>,
        queue: &str,
        level: QoS,
    ) -> Result<(), AdapterError> {
        if session.read().consumers.iter().any(|t| t.queue == queue) {
            return Ok(());
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let no_ack = level == QoS::AtMostOnce;
        let tag = self.backend.consume(queue, no_ack, tx).await?;
        session.write().consumers.push(tag.clone());
        self.spawn_pump(session.clone(), tag, level, rx);
        Ok(())
    }

    /// Forward queue deliveries to the session's sink until the queue side
    /// closes or the sink fails
    fn spawn_pump(
        &self,
        session: Arc<RwLock<Session>>,
        tag: ConsumerTag,
        level: QoS,
        mut rx: mpsc::UnboundedReceiver<Delivery>,
    ) {
        let backend = self.backend.clone();
        tokio::spawn(async move {
            while let Some(delivery) = rx.recv().await {
                let effective = match level {
                    QoS::AtMostOnce => QoS::AtMostOnce,
                    QoS::AtLeastOnce => delivery.props.qos,
                };

                // QoS 0 messages in the acked queue have no PUBACK coming;
                // settle them with the broker right away
                let ack_now = level == QoS::AtLeastOnce && effective == QoS::AtMostOnce;
                let delivery_id = match effective {
                    QoS::AtLeastOnce => Some(session.write().record_pending(AckTarget::Broker {
                        queue: tag.queue.clone(),
                        delivery_tag: delivery.delivery_tag,
                    })),
                    QoS::AtMostOnce => None,
                };

                let msg = OutboundMessage {
                    topic: from_routing_key(&delivery.routing_key),
                    qos: effective,
                    payload: delivery.payload,
                    delivery_id,
                };

                let sink = session.read().sink.clone();
                if sink.deliver(msg).await.is_err() {
                    if let Some(id) = delivery_id {
                        session.write().take_pending(id);
                    }
                    session.write().consumers.retain(|t| t.queue != tag.queue);
                    if let Err(e) = backend.cancel(&tag).await {
                        warn!("cancel failed for {}: {}", tag.queue, e);
                    }
                    sink.connection_lost(LossCause::DeliveryFailure);
                    return;
                }

                if ack_now {
                    if let Err(e) = backend.ack(&tag.queue, delivery.delivery_tag).await {
                        warn!("ack failed for {}: {}", tag.queue, e);
                    }
                }
            }
        });
    }
}
