//! Callback event kinds and their decoded payloads.
//!
//! The SMS platform tags every callback with a `type` discriminator and carries
//! the kind-specific fields in a `data` object. Each kind decodes into its own
//! struct; [`CallbackEnvelope`] is the tagged union the dispatcher routes on.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The four callback kinds the platform pushes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A user replied to a message (`SMS_REPLY`)
    Reply,
    /// Delivery status of a sent message (`SMS_REPORT`)
    DeliveryReport,
    /// Result of a template review (`SMS_TEMPLATE`)
    TemplateAudit,
    /// Result of a signature review (`SMS_SIGN`)
    SignatureAudit,
}

impl EventKind {
    /// Every kind, in registry slot order.
    pub const ALL: [EventKind; 4] = [
        EventKind::Reply,
        EventKind::DeliveryReport,
        EventKind::TemplateAudit,
        EventKind::SignatureAudit,
    ];

    /// The wire value of the `type` field for this kind.
    pub fn discriminator(&self) -> &'static str {
        match self {
            EventKind::Reply => "SMS_REPLY",
            EventKind::DeliveryReport => "SMS_REPORT",
            EventKind::TemplateAudit => "SMS_TEMPLATE",
            EventKind::SignatureAudit => "SMS_SIGN",
        }
    }

    /// Resolve a wire `type` value.
    ///
    /// Matching is exact and case-sensitive. The dispatcher strips
    /// surrounding whitespace before calling this.
    pub fn from_discriminator(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.discriminator() == value)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.discriminator())
    }
}

/// A user's reply to a previously sent message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyEvent {
    /// Phone number the reply came from
    pub phone: String,
    /// Reply time in milliseconds since the Unix epoch
    pub reply_time: i64,
    /// Reply text
    pub content: String,
}

/// Delivery outcome for a single sent message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryReport {
    /// Message ID returned by the send API
    pub msg_id: String,
    /// Vendor status code (4001 means delivered)
    pub status: i32,
    /// Receipt time in milliseconds since the Unix epoch
    pub receive_time: i64,
    /// Destination phone number
    pub phone: String,
}

impl DeliveryReport {
    /// Status code the platform uses for a successful delivery.
    pub const DELIVERED: i32 = 4001;

    pub fn is_delivered(&self) -> bool {
        self.status == Self::DELIVERED
    }
}

/// Review result for a message template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateAuditResult {
    pub temp_id: i64,
    /// 1 approved, 2 rejected
    pub status: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refuse_reason: Option<String>,
}

/// Review result for a message signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureAuditResult {
    pub sign_id: i64,
    /// 1 approved, 2 rejected
    pub status: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refuse_reason: Option<String>,
}

/// A payload type that belongs to exactly one [`EventKind`].
pub trait CallbackEvent: fmt::Debug + DeserializeOwned + Send + Sync + 'static {
    /// The kind whose `data` field decodes into this type.
    const KIND: EventKind;

    /// Wrap the payload in its envelope variant.
    fn into_envelope(self) -> CallbackEnvelope;
}

impl CallbackEvent for ReplyEvent {
    const KIND: EventKind = EventKind::Reply;

    fn into_envelope(self) -> CallbackEnvelope {
        CallbackEnvelope::Reply(self)
    }
}

impl CallbackEvent for DeliveryReport {
    const KIND: EventKind = EventKind::DeliveryReport;

    fn into_envelope(self) -> CallbackEnvelope {
        CallbackEnvelope::DeliveryReport(self)
    }
}

impl CallbackEvent for TemplateAuditResult {
    const KIND: EventKind = EventKind::TemplateAudit;

    fn into_envelope(self) -> CallbackEnvelope {
        CallbackEnvelope::TemplateAudit(self)
    }
}

impl CallbackEvent for SignatureAuditResult {
    const KIND: EventKind = EventKind::SignatureAudit;

    fn into_envelope(self) -> CallbackEnvelope {
        CallbackEnvelope::SignatureAudit(self)
    }
}

/// A decoded callback, tagged by kind.
///
/// Created per request and dropped once the bound processor returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackEnvelope {
    Reply(ReplyEvent),
    DeliveryReport(DeliveryReport),
    TemplateAudit(TemplateAuditResult),
    SignatureAudit(SignatureAuditResult),
}

impl CallbackEnvelope {
    pub fn kind(&self) -> EventKind {
        match self {
            CallbackEnvelope::Reply(_) => EventKind::Reply,
            CallbackEnvelope::DeliveryReport(_) => EventKind::DeliveryReport,
            CallbackEnvelope::TemplateAudit(_) => EventKind::TemplateAudit,
            CallbackEnvelope::SignatureAudit(_) => EventKind::SignatureAudit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discriminator_lookup() {
        for kind in EventKind::ALL {
            assert_eq!(EventKind::from_discriminator(kind.discriminator()), Some(kind));
        }
        assert_eq!(EventKind::from_discriminator("sms_report"), None);
        assert_eq!(EventKind::from_discriminator(""), None);
    }

    #[test]
    fn test_delivery_report_uses_vendor_field_names() {
        let report: DeliveryReport = serde_json::from_str(
            r#"{"msgId":"1558520870000","status":4001,"receiveTime":1492150166000,"phone":"13800138000"}"#,
        )
        .unwrap();

        assert_eq!(report.msg_id, "1558520870000");
        assert!(report.is_delivered());
        assert_eq!(report.receive_time, 1492150166000);
    }

    #[test]
    fn test_audit_result_refuse_reason_is_optional() {
        let approved: TemplateAuditResult =
            serde_json::from_str(r#"{"tempId":12,"status":1}"#).unwrap();
        assert_eq!(approved.refuse_reason, None);

        let rejected: SignatureAuditResult =
            serde_json::from_str(r#"{"signId":7,"status":2,"refuseReason":"unclear brand"}"#)
                .unwrap();
        assert_eq!(rejected.refuse_reason.as_deref(), Some("unclear brand"));
    }

    #[test]
    fn test_envelope_kind() {
        let envelope = CallbackEnvelope::Reply(ReplyEvent {
            phone: "13800138000".to_string(),
            reply_time: 0,
            content: "TD".to_string(),
        });
        assert_eq!(envelope.kind(), EventKind::Reply);
    }
}
