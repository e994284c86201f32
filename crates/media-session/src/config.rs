//! Media session configuration.
//!
//! Configuration is loaded from environment variables with defaults suitable
//! for a single-host deployment. Malformed values are rejected rather than
//! silently replaced.

use crate::system_info;
use mediasoup::prelude::*;
use mediasoup::worker::{WorkerLogLevel, WorkerLogTag, WorkerSettings};
use std::collections::HashMap;
use std::env;
use std::net::IpAddr;
use std::num::{NonZeroU32, NonZeroU8};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default media worker log level.
pub const DEFAULT_WORKER_LOG_LEVEL: &str = "warn";

/// Default RTC port range (inclusive).
pub const DEFAULT_RTC_MIN_PORT: u16 = 40000;
pub const DEFAULT_RTC_MAX_PORT: u16 = 49999;

/// Default listen address for media transports.
pub const DEFAULT_LISTEN_IP: &str = "0.0.0.0";

/// Default initial available outgoing bitrate (bps).
pub const DEFAULT_INITIAL_OUTGOING_BITRATE: u32 = 600_000;

/// Default channel codec.
pub const DEFAULT_AUDIO_MIME_TYPE: &str = "audio/opus";
pub const DEFAULT_AUDIO_CLOCK_RATE: u32 = 48000;
pub const DEFAULT_AUDIO_CHANNELS: u8 = 2;
pub const DEFAULT_AUDIO_RTCP_FEEDBACK: &str = "transport-cc";

/// Default health endpoint bind address.
pub const DEFAULT_HEALTH_BIND_ADDRESS: &str = "0.0.0.0:8090";

/// Default delay between a worker death and process exit, for log flushing.
pub const DEFAULT_WORKER_DEATH_GRACE_MS: u64 = 2000;

/// Default instance ID prefix.
pub const DEFAULT_INSTANCE_ID_PREFIX: &str = "ms";

/// Audio codec every channel router is created with.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioCodecConfig {
    pub mime_type: MimeTypeAudio,
    pub clock_rate: NonZeroU32,
    pub channels: NonZeroU8,
    pub rtcp_feedback: Vec<RtcpFeedback>,
}

/// Media session configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Unique identifier for this instance (logs, status).
    pub instance_id: String,

    /// Number of media workers (default: CPU core count).
    pub num_workers: usize,

    pub worker_log_level: WorkerLogLevel,

    /// Inclusive port range every transport binds in.
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,

    /// Addresses media transports listen on.
    pub listen_ips: Vec<IpAddr>,

    /// Public address advertised in ICE candidates (NAT, containers).
    pub announced_address: Option<String>,

    pub initial_outgoing_bitrate: u32,

    pub audio_codec: AudioCodecConfig,

    /// Health and metrics endpoint bind address (default: "0.0.0.0:8090").
    pub health_bind_address: String,

    /// Delay before the process exits after a worker death.
    pub worker_death_grace: Duration,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

fn parse_var<T: FromStr>(
    vars: &HashMap<String, String>,
    name: &str,
    default: T,
) -> Result<T, ConfigError> {
    match vars.get(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("{name}={raw}"))),
        None => Ok(default),
    }
}

fn split_list(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(',').map(str::trim).filter(|s| !s.is_empty())
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let num_workers = match vars.get("MS_NUM_WORKERS") {
            Some(_) => parse_var(vars, "MS_NUM_WORKERS", 0usize)?,
            None => system_info::cpu_core_count(),
        };
        if num_workers == 0 {
            return Err(ConfigError::InvalidValue(
                "MS_NUM_WORKERS must be at least 1".to_string(),
            ));
        }

        let raw_log_level = vars
            .get("MS_WORKER_LOG_LEVEL")
            .map_or(DEFAULT_WORKER_LOG_LEVEL, String::as_str);
        let worker_log_level = parse_log_level(raw_log_level).ok_or_else(|| {
            ConfigError::InvalidValue(format!("MS_WORKER_LOG_LEVEL={raw_log_level}"))
        })?;

        let rtc_min_port = parse_var(vars, "MS_RTC_MIN_PORT", DEFAULT_RTC_MIN_PORT)?;
        let rtc_max_port = parse_var(vars, "MS_RTC_MAX_PORT", DEFAULT_RTC_MAX_PORT)?;
        if rtc_min_port > rtc_max_port {
            return Err(ConfigError::InvalidValue(format!(
                "MS_RTC_MIN_PORT ({rtc_min_port}) exceeds MS_RTC_MAX_PORT ({rtc_max_port})"
            )));
        }

        let listen_ips = split_list(
            vars.get("MS_LISTEN_IPS")
                .map_or(DEFAULT_LISTEN_IP, String::as_str),
        )
        .map(|ip| {
            ip.parse::<IpAddr>()
                .map_err(|_| ConfigError::InvalidValue(format!("MS_LISTEN_IPS contains {ip}")))
        })
        .collect::<Result<Vec<_>, _>>()?;
        if listen_ips.is_empty() {
            return Err(ConfigError::InvalidValue(
                "MS_LISTEN_IPS must name at least one address".to_string(),
            ));
        }

        let announced_address = vars
            .get("MS_ANNOUNCED_ADDRESS")
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        let initial_outgoing_bitrate = parse_var(
            vars,
            "MS_INITIAL_OUTGOING_BITRATE",
            DEFAULT_INITIAL_OUTGOING_BITRATE,
        )?;

        let raw_mime_type = vars
            .get("MS_AUDIO_MIME_TYPE")
            .map_or(DEFAULT_AUDIO_MIME_TYPE, String::as_str);
        let mime_type = parse_audio_mime_type(raw_mime_type).ok_or_else(|| {
            ConfigError::InvalidValue(format!(
                "MS_AUDIO_MIME_TYPE={raw_mime_type} is not a supported audio codec"
            ))
        })?;
        let clock_rate = NonZeroU32::new(parse_var(
            vars,
            "MS_AUDIO_CLOCK_RATE",
            DEFAULT_AUDIO_CLOCK_RATE,
        )?)
        .ok_or_else(|| {
            ConfigError::InvalidValue("MS_AUDIO_CLOCK_RATE must be positive".to_string())
        })?;
        let channels = NonZeroU8::new(parse_var(vars, "MS_AUDIO_CHANNELS", DEFAULT_AUDIO_CHANNELS)?)
            .ok_or_else(|| {
                ConfigError::InvalidValue("MS_AUDIO_CHANNELS must be positive".to_string())
            })?;
        let rtcp_feedback = split_list(
            vars.get("MS_AUDIO_RTCP_FEEDBACK")
                .map_or(DEFAULT_AUDIO_RTCP_FEEDBACK, String::as_str),
        )
        .map(|kind| {
            parse_rtcp_feedback(kind).ok_or_else(|| {
                ConfigError::InvalidValue(format!("MS_AUDIO_RTCP_FEEDBACK contains {kind}"))
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

        let audio_codec = AudioCodecConfig {
            mime_type,
            clock_rate,
            channels,
            rtcp_feedback,
        };

        let health_bind_address = vars
            .get("MS_HEALTH_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_HEALTH_BIND_ADDRESS.to_string());

        let worker_death_grace = Duration::from_millis(parse_var(
            vars,
            "MS_WORKER_DEATH_GRACE_MS",
            DEFAULT_WORKER_DEATH_GRACE_MS,
        )?);

        // Generate instance ID
        let instance_id = vars.get("MS_INSTANCE_ID").cloned().unwrap_or_else(|| {
            let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
            let uuid_suffix = uuid::Uuid::new_v4().to_string();
            let short_suffix = uuid_suffix.get(..8).unwrap_or("00000000");
            format!("{DEFAULT_INSTANCE_ID_PREFIX}-{hostname}-{short_suffix}")
        });

        Ok(Config {
            instance_id,
            num_workers,
            worker_log_level,
            rtc_min_port,
            rtc_max_port,
            listen_ips,
            announced_address,
            initial_outgoing_bitrate,
            audio_codec,
            health_bind_address,
            worker_death_grace,
        })
    }

    /// Settings for every pool worker. Port ranges are per transport, see
    /// [`Self::listen_infos`].
    #[must_use]
    pub fn worker_settings(&self) -> WorkerSettings {
        let mut settings = WorkerSettings::default();
        settings.log_level = self.worker_log_level;
        settings.log_tags = vec![
            WorkerLogTag::Info,
            WorkerLogTag::Ice,
            WorkerLogTag::Dtls,
            WorkerLogTag::Rtp,
            WorkerLogTag::Rtcp,
        ];
        settings
    }

    /// Codec set every channel router is created with.
    #[must_use]
    pub fn media_codecs(&self) -> Vec<RtpCodecCapability> {
        let codec = &self.audio_codec;
        let parameters = if codec.mime_type == MimeTypeAudio::Opus {
            RtpCodecParametersParameters::from([("useinbandfec", 1_u32.into())])
        } else {
            RtpCodecParametersParameters::default()
        };

        vec![RtpCodecCapability::Audio {
            mime_type: codec.mime_type,
            preferred_payload_type: None,
            clock_rate: codec.clock_rate,
            channels: codec.channels,
            parameters,
            rtcp_feedback: codec.rtcp_feedback.clone(),
        }]
    }

    /// One UDP and one TCP listener per listen address, UDP first.
    #[must_use]
    pub fn listen_infos(&self) -> Vec<ListenInfo> {
        self.listen_ips
            .iter()
            .flat_map(|ip| {
                [Protocol::Udp, Protocol::Tcp].map(|protocol| ListenInfo {
                    protocol,
                    ip: *ip,
                    announced_address: self.announced_address.clone(),
                    port: None,
                    port_range: Some(self.rtc_min_port..=self.rtc_max_port),
                    flags: None,
                    send_buffer_size: None,
                    recv_buffer_size: None,
                })
            })
            .collect()
    }

    /// Options for every WebRTC transport: UDP and TCP both enabled, UDP
    /// preferred.
    pub fn transport_options(&self) -> Result<WebRtcTransportOptions, ConfigError> {
        let mut listen_infos = self.listen_infos().into_iter();
        let first = listen_infos.next().ok_or_else(|| {
            ConfigError::InvalidValue("MS_LISTEN_IPS must name at least one address".to_string())
        })?;
        let listen_infos = listen_infos.fold(WebRtcTransportListenInfos::new(first), |infos, info| {
            infos.insert(info)
        });

        let mut options = WebRtcTransportOptions::new(listen_infos);
        options.enable_udp = true;
        options.enable_tcp = true;
        options.prefer_udp = true;
        options.initial_available_outgoing_bitrate = self.initial_outgoing_bitrate;
        Ok(options)
    }
}

fn parse_log_level(raw: &str) -> Option<WorkerLogLevel> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "debug" => Some(WorkerLogLevel::Debug),
        "warn" => Some(WorkerLogLevel::Warn),
        "error" => Some(WorkerLogLevel::Error),
        "none" => Some(WorkerLogLevel::None),
        _ => None,
    }
}

fn parse_audio_mime_type(raw: &str) -> Option<MimeTypeAudio> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "audio/opus" => Some(MimeTypeAudio::Opus),
        "audio/pcmu" => Some(MimeTypeAudio::Pcmu),
        "audio/pcma" => Some(MimeTypeAudio::Pcma),
        "audio/g722" => Some(MimeTypeAudio::G722),
        _ => None,
    }
}

fn parse_rtcp_feedback(raw: &str) -> Option<RtcpFeedback> {
    match raw.to_ascii_lowercase().as_str() {
        "transport-cc" => Some(RtcpFeedback::TransportCc),
        "nack" => Some(RtcpFeedback::Nack),
        _ => None,
    }
}
