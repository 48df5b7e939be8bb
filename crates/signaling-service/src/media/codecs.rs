//! The fixed codec set every session router is created with.

use crate::media::types::RtpCodecCapability;
use common::types::MediaKind;
use serde_json::{json, Map, Value};

const OPUS_CLOCK_RATE: u32 = 48_000;
const VIDEO_CLOCK_RATE: u32 = 90_000;

/// Initial bitrate hint (kbps) given to video encoders.
const VIDEO_START_BITRATE_KBPS: u32 = 1000;

fn parameters(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// Opus stereo, VP8 and H264 constrained-baseline.
#[must_use]
pub fn media_codecs() -> Vec<RtpCodecCapability> {
    vec![
        RtpCodecCapability {
            kind: MediaKind::Audio,
            mime_type: "audio/opus".to_string(),
            preferred_payload_type: None,
            clock_rate: OPUS_CLOCK_RATE,
            channels: Some(2),
            parameters: Map::new(),
            rtcp_feedback: Vec::new(),
        },
        RtpCodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/VP8".to_string(),
            preferred_payload_type: None,
            clock_rate: VIDEO_CLOCK_RATE,
            channels: None,
            parameters: parameters(json!({
                "x-google-start-bitrate": VIDEO_START_BITRATE_KBPS,
            })),
            rtcp_feedback: Vec::new(),
        },
        RtpCodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/H264".to_string(),
            preferred_payload_type: None,
            clock_rate: VIDEO_CLOCK_RATE,
            channels: None,
            parameters: parameters(json!({
                "packetization-mode": 1,
                "profile-level-id": "4d0032",
                "level-asymmetry-allowed": 1,
                "x-google-start-bitrate": VIDEO_START_BITRATE_KBPS,
            })),
            rtcp_feedback: Vec::new(),
        },
    ]
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_set() {
        let codecs = media_codecs();
        assert_eq!(codecs.len(), 3);

        let opus = codecs.iter().find(|c| c.mime_type == "audio/opus").unwrap();
        assert_eq!(opus.kind, MediaKind::Audio);
        assert_eq!(opus.clock_rate, 48_000);
        assert_eq!(opus.channels, Some(2));

        let vp8 = codecs.iter().find(|c| c.mime_type == "video/VP8").unwrap();
        assert_eq!(vp8.clock_rate, 90_000);
        assert_eq!(vp8.parameters["x-google-start-bitrate"], 1000);

        let h264 = codecs.iter().find(|c| c.mime_type == "video/H264").unwrap();
        assert_eq!(h264.parameters["packetization-mode"], 1);
        assert_eq!(h264.parameters["profile-level-id"], "4d0032");
        assert_eq!(h264.parameters["level-asymmetry-allowed"], 1);
    }

    #[test]
    fn test_every_codec_matches_its_kind() {
        for codec in media_codecs() {
            assert!(codec.kind.matches_mime_type(&codec.mime_type));
        }
    }
}
