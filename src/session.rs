//! An [OD4Session] is a brokerless publish / subscribe endpoint. All sessions with the same group
//!  id exchange [Envelope]s via UDP multicast on `225.0.0.{group_id}:12175`.
//!
//! ## Execution contexts
//!
//! * Data triggers run on the session's receive task, one envelope at a time, in arrival order.
//!    A slow data trigger delays all subsequent envelopes.
//! * Time triggers run on the session's scheduler task, see [TimeTriggerScheduler].
//! * [OD4Session::time_trigger] runs in the caller's task.
//!
//! Dropping the session stops both tasks: callbacks that are running complete, no new ones start.

pub mod data_triggers;
pub mod session_config;
pub mod time_triggers;

pub use data_triggers::{DataTriggers, TriggerId};
pub use session_config::SessionConfig;
pub use time_triggers::{TimeTriggerScheduler, TriggerControl};

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tracing::{debug, info, trace, warn};

use crate::envelope::Envelope;
use crate::time::TimeStamp;
use crate::transport::{SendStatus, TransportError, UdpReceiver, UdpReceiverConfig, UdpSender, UdpSenderConfig};


#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("invalid session configuration: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

pub struct OD4Session {
    config: SessionConfig,
    sender: UdpSender,
    receiver: UdpReceiver,
    data_triggers: Arc<DataTriggers>,
    time_triggers: TimeTriggerScheduler,
}

impl OD4Session {
    pub async fn new(group_id: u8) -> Result<OD4Session, SessionError> {
        Self::with_config(SessionConfig::new(group_id)).await
    }

    pub async fn with_config(config: SessionConfig) -> Result<OD4Session, SessionError> {
        config.validate()
            .map_err(|e| SessionError::InvalidConfig(format!("{:#}", e)))?;

        let group_addr = IpAddr::V4(config.multicast_addr());

        let sender_config = UdpSenderConfig {
            multicast_interface: config.multicast_interface,
            multicast_ttl: config.multicast_ttl,
        };
        let sender = UdpSender::with_config(group_addr, config.port, &sender_config).await?;

        let receiver_config = UdpReceiverConfig {
            multicast_interface: config.multicast_interface,
            local_send_from_port: config.drop_own_datagrams.then(|| sender.send_from_port()),
        };
        let data_triggers = Arc::new(DataTriggers::default());
        let triggers = data_triggers.clone();
        let receiver = UdpReceiver::with_config(group_addr, config.port, receiver_config, move |data, from, receive_time| {
            on_datagram(&triggers, data, from, receive_time);
        }).await?;

        info!(group_id = config.group_id, "session started on {:?}", SocketAddr::new(group_addr, config.port));

        Ok(OD4Session {
            config,
            sender,
            receiver,
            data_triggers,
            time_triggers: TimeTriggerScheduler::new(),
        })
    }

    pub fn group_id(&self) -> u8 {
        self.config.group_id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.receiver.is_running()
    }

    /// Registers a callback for all received envelopes of a given data type. Callbacks for the
    ///  same data type are invoked in the order of their registration.
    pub fn add_data_trigger(&self, data_type: i32, callback: impl Fn(&Envelope) + Send + Sync + 'static) -> TriggerId {
        self.data_triggers.add(data_type, callback)
    }

    /// Registers a callback for all received envelopes, regardless of their data type. Catch-all
    ///  callbacks are invoked after the callbacks for the specific data type.
    pub fn add_catch_all_trigger(&self, callback: impl Fn(&Envelope) + Send + Sync + 'static) -> TriggerId {
        self.data_triggers.add_catch_all(callback)
    }

    pub fn remove_trigger(&self, id: TriggerId) -> bool {
        self.data_triggers.remove(id)
    }

    pub fn remove_data_triggers(&self, data_type: i32) -> usize {
        self.data_triggers.remove_data_type(data_type)
    }

    /// Schedules a periodic callback on the session's scheduler task. It is first invoked right
    ///  away, and then every `interval` until it returns [TriggerControl::Stop].
    pub fn set_time_trigger<F>(&self, interval: Duration, callback: F)
    where F: FnMut() -> TriggerControl + Send + 'static
    {
        self.time_triggers.add(interval, callback);
    }

    /// Like [OD4Session::set_time_trigger], but runs the callback in the calling task and returns
    ///  only after it answered [TriggerControl::Stop].
    pub async fn time_trigger<F>(&self, interval: Duration, callback: F)
    where F: FnMut() -> TriggerControl
    {
        time_triggers::run_time_trigger(interval, callback).await
    }

    /// the number of time triggers on the scheduler task that did not stop yet
    pub fn num_time_triggers(&self) -> usize {
        self.time_triggers.num_active()
    }

    /// Broadcasts an envelope to the session's group. If the envelope's `sent` timestamp is not
    ///  set, it is set to the current time.
    pub async fn send(&self, mut envelope: Envelope) -> SendStatus {
        if envelope.sent.is_epoch() {
            envelope.sent = TimeStamp::now();
        }

        match envelope.encode() {
            Ok(buf) => {
                trace!(data_type = envelope.data_type, sender_stamp = envelope.sender_stamp, "sending envelope");
                self.sender.send(&buf).await
            }
            Err(e) => {
                warn!(error = %e, data_type = envelope.data_type, "could not encode envelope");
                SendStatus {
                    bytes_sent: 0,
                    error_code: libc::E2BIG,
                }
            }
        }
    }
}

fn on_datagram(triggers: &DataTriggers, data: &[u8], from: SocketAddr, receive_time: SystemTime) {
    for envelope in Envelope::frames(data) {
        match envelope {
            Ok(mut envelope) => {
                envelope.received = receive_time.into();
                trace!(data_type = envelope.data_type, sender_stamp = envelope.sender_stamp, ?from, "received envelope");
                triggers.dispatch(&envelope);
            }
            Err(e) => {
                debug!(error = %e, ?from, "dropping malformed datagram");
            }
        }
    }
}
