//! MQTT quality-of-service levels.

use crate::error::Error;

/// MQTT delivery guarantee for a single PUBLISH.
///
/// The derived ordering makes QoS downgrade a plain `min`: a message is
/// delivered to a subscriber at `min(publish_qos, granted_qos)`.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum QoS {
    /// At most once delivery.
    #[default]
    AtMostOnce = 0,
    /// At least once delivery.
    AtLeastOnce = 1,
    /// Exactly once delivery.
    ExactlyOnce = 2,
}

impl TryFrom<u8> for QoS {
    type Error = Error;

    fn try_from(value: u8) -> crate::Result<Self> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            _ => Err(Error::Malformed("QoS level must be 0, 1 or 2")),
        }
    }
}
