//! Wire codec for the [`Message`] envelope.
//!
//! Frames are UTF-8 JSON.  The gateway writes them as binary WebSocket
//! frames and accepts both binary and text frames on read.

use bytes::Bytes;
use fleet_types::{GatewayError, Message};

/// Largest frame the gateway will decode (64 KiB).
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 64 * 1024;

/// Serialize `msg` into a frame body.
pub fn encode(msg: &Message) -> Result<Bytes, GatewayError> {
    serde_json::to_vec(msg)
        .map(Bytes::from)
        .map_err(|e| GatewayError::Decode(format!("encode {}: {e}", msg.msg_type)))
}

/// Parse a frame body, rejecting anything larger than `limit` bytes before
/// touching the JSON.
pub fn decode(frame: &[u8], limit: usize) -> Result<Message, GatewayError> {
    if frame.len() > limit {
        return Err(GatewayError::MessageTooLarge {
            size: frame.len(),
            limit,
        });
    }
    serde_json::from_slice(frame).map_err(|e| GatewayError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_types::{EStopPayload, MessageType, VelocityCmdPayload};
    use proptest::prelude::*;

    #[test]
    fn round_trip_preserves_message() {
        let msg = Message::new(MessageType::VelocityCmd)
            .with_robot("r1")
            .with_user("alice")
            .with_payload(&VelocityCmdPayload {
                linear_x: 0.5,
                angular_z: -0.1,
                ..Default::default()
            });
        let frame = encode(&msg).unwrap();
        assert_eq!(decode(&frame, DEFAULT_MAX_MESSAGE_BYTES).unwrap(), msg);
    }

    #[test]
    fn round_trip_preserves_error_field() {
        let msg = Message::error(fleet_types::ErrorCode::LockHeld, "robot r1 is locked");
        let back = decode(&encode(&msg).unwrap(), DEFAULT_MAX_MESSAGE_BYTES).unwrap();
        assert_eq!(back.error.as_deref(), Some("robot r1 is locked"));
        assert_eq!(back, msg);
    }

    #[test]
    fn round_trip_keeps_every_float_bit() {
        let msg = Message::new(MessageType::VelocityCmd)
            .with_robot("r1")
            .with_payload(&VelocityCmdPayload {
                linear_x: -7.4250878816572214,
                angular_z: 0.1 + 0.2,
                ..Default::default()
            });
        let back = decode(&encode(&msg).unwrap(), DEFAULT_MAX_MESSAGE_BYTES).unwrap();
        let payload: VelocityCmdPayload = back.payload_as().unwrap();
        assert_eq!(payload.linear_x.to_bits(), (-7.4250878816572214f64).to_bits());
        assert_eq!(payload.angular_z.to_bits(), (0.1f64 + 0.2).to_bits());
        assert_eq!(back, msg);
    }

    const ALL_TYPES: [MessageType; 20] = [
        MessageType::Auth,
        MessageType::VelocityCmd,
        MessageType::NavGoal,
        MessageType::NavCancel,
        MessageType::Estop,
        MessageType::OpLock,
        MessageType::OpUnlock,
        MessageType::Ping,
        MessageType::Subscribe,
        MessageType::Unsubscribe,
        MessageType::RecordStart,
        MessageType::RecordStop,
        MessageType::SensorData,
        MessageType::RobotStatus,
        MessageType::CmdAck,
        MessageType::LockStatus,
        MessageType::ConnStatus,
        MessageType::Error,
        MessageType::Pong,
        MessageType::SafetyAlert,
    ];

    fn finite_f64() -> impl Strategy<Value = f64> {
        prop::num::f64::NORMAL | prop::num::f64::SUBNORMAL | prop::num::f64::ZERO
    }

    proptest! {
        #[test]
        fn any_message_survives_round_trip(
            msg_type in prop::sample::select(ALL_TYPES.to_vec()),
            robot_id in "[a-z0-9-]{0,12}",
            user_id in "[a-z0-9-]{0,12}",
            axes in prop::array::uniform6(finite_f64()),
            error in prop::option::of(".{0,24}"),
        ) {
            let mut msg = Message::new(msg_type)
                .with_robot(robot_id)
                .with_user(user_id)
                .with_payload(&VelocityCmdPayload {
                    linear_x: axes[0],
                    linear_y: axes[1],
                    linear_z: axes[2],
                    angular_x: axes[3],
                    angular_y: axes[4],
                    angular_z: axes[5],
                });
            msg.error = error;

            let back = decode(&encode(&msg).unwrap(), DEFAULT_MAX_MESSAGE_BYTES).unwrap();
            prop_assert_eq!(back, msg);
        }

        #[test]
        fn velocity_in_operating_range_is_exact(linear_x in -10.0f64..10.0, angular_z in -10.0f64..10.0) {
            let msg = Message::new(MessageType::VelocityCmd)
                .with_robot("r1")
                .with_payload(&VelocityCmdPayload { linear_x, angular_z, ..Default::default() });
            let back = decode(&encode(&msg).unwrap(), DEFAULT_MAX_MESSAGE_BYTES).unwrap();
            let payload: VelocityCmdPayload = back.payload_as().unwrap();
            prop_assert_eq!(payload.linear_x.to_bits(), linear_x.to_bits());
            prop_assert_eq!(payload.angular_z.to_bits(), angular_z.to_bits());
        }
    }

    #[test]
    fn oversized_frame_is_rejected_before_parsing() {
        let frame = vec![b' '; 128];
        assert!(matches!(
            decode(&frame, 64),
            Err(GatewayError::MessageTooLarge { size: 128, limit: 64 })
        ));
    }

    #[test]
    fn garbage_is_a_decode_error() {
        assert!(matches!(
            decode(b"{not json", DEFAULT_MAX_MESSAGE_BYTES),
            Err(GatewayError::Decode(_))
        ));
        assert!(matches!(
            decode(br#"{"type":"teleport"}"#, DEFAULT_MAX_MESSAGE_BYTES),
            Err(GatewayError::Decode(_))
        ));
    }

    #[test]
    fn client_frames_decode_with_typed_payload() {
        let frame = br#"{"type":"estop","robot_id":"r1","payload":{"activate":true}}"#;
        let msg = decode(frame, DEFAULT_MAX_MESSAGE_BYTES).unwrap();
        let payload: EStopPayload = msg.payload_as().unwrap();
        assert!(payload.activate);
        assert!(!payload.all);
    }
}
