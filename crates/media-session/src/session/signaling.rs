//! Signaling wire messages.
//!
//! JSON objects tagged by `"type"` with kebab-case operation names and
//! camelCase fields, e.g.
//!
//! ```json
//! {"type": "create-transport", "channelId": "c1", "userId": "u1", "direction": "send"}
//! ```

use crate::errors::SessionError;
use crate::managers::{ConsumerParameters, Direction, TransportInfo};
use common::types::{ChannelId, UserId};
use mediasoup::prelude::*;
use mediasoup::rtp_parameters::RtpCapabilitiesFinalized;
use mediasoup::transport::TransportId;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalingRequest {
    #[serde(rename_all = "camelCase")]
    GetRouterCapabilities { channel_id: ChannelId },

    #[serde(rename_all = "camelCase")]
    CreateTransport {
        channel_id: ChannelId,
        user_id: UserId,
        direction: Direction,
    },

    #[serde(rename_all = "camelCase")]
    ConnectTransport {
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
    },

    #[serde(rename_all = "camelCase")]
    Produce {
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        user_id: UserId,
        channel_id: ChannelId,
    },

    #[serde(rename_all = "camelCase")]
    Consume {
        transport_id: TransportId,
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
        user_id: UserId,
        channel_id: ChannelId,
    },

    /// Floor granted: open the speaker's gate.
    #[serde(rename_all = "camelCase")]
    PttStart { producer_id: ProducerId },

    #[serde(rename_all = "camelCase")]
    PttStop { producer_id: ProducerId },

    #[serde(rename_all = "camelCase")]
    LeaveChannel {
        user_id: UserId,
        channel_id: ChannelId,
    },

    #[serde(rename_all = "camelCase")]
    Disconnect { user_id: UserId },
}

impl SignalingRequest {
    /// Operation label for logs and metrics.
    #[must_use]
    pub fn operation(&self) -> &'static str {
        match self {
            SignalingRequest::GetRouterCapabilities { .. } => "get_router_capabilities",
            SignalingRequest::CreateTransport { .. } => "create_transport",
            SignalingRequest::ConnectTransport { .. } => "connect_transport",
            SignalingRequest::Produce { .. } => "produce",
            SignalingRequest::Consume { .. } => "consume",
            SignalingRequest::PttStart { .. } => "ptt_start",
            SignalingRequest::PttStop { .. } => "ptt_stop",
            SignalingRequest::LeaveChannel { .. } => "leave_channel",
            SignalingRequest::Disconnect { .. } => "disconnect",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalingResponse {
    #[serde(rename_all = "camelCase")]
    RouterCapabilities { rtp_capabilities: RtpCapabilitiesFinalized },

    TransportCreated(TransportInfo),

    #[serde(rename_all = "camelCase")]
    TransportConnected { transport_id: TransportId },

    #[serde(rename_all = "camelCase")]
    Produced { producer_id: ProducerId },

    Consumed(ConsumerParameters),

    #[serde(rename_all = "camelCase")]
    PttStarted { producer_id: ProducerId },

    #[serde(rename_all = "camelCase")]
    PttStopped { producer_id: ProducerId },

    #[serde(rename_all = "camelCase")]
    ChannelLeft {
        producers_closed: usize,
        consumers_closed: usize,
    },

    #[serde(rename_all = "camelCase")]
    Disconnected {
        transports_closed: usize,
        producers_closed: usize,
        consumers_closed: usize,
    },
}

/// Error reply sent back to the client that issued the failed operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalingError {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub code: i32,
    pub message: String,
}

impl From<&SessionError> for SignalingError {
    fn from(err: &SessionError) -> Self {
        Self {
            kind: "error",
            code: err.error_code(),
            message: err.client_message(),
        }
    }
}
