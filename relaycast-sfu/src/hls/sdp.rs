//! Session descriptions handed to the transcoder
//!
//! One `m=video` line describing the RTP the relay transport sends to
//! `ip:port`. The direction attribute is written from the sender's side.

use std::net::IpAddr;

use crate::engine::RtpCodecParameters;

const VIDEO_CLOCK_RATE: u32 = 90_000;
const H264_PROFILE_LEVEL_ID: &str = "42e01f";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpDescription {
    pub ip: IpAddr,
    pub port: u16,
    pub payload_type: u8,
    pub codec_name: String,
    pub session_name: String,
}

impl SdpDescription {
    pub fn new(ip: IpAddr, port: u16, payload_type: u8, codec_name: impl Into<String>) -> Self {
        Self {
            ip,
            port,
            payload_type,
            codec_name: codec_name.into(),
            session_name: "Relaycast Producer Stream".to_string(),
        }
    }

    /// Describe the first codec the relay consumer negotiated
    #[must_use]
    pub fn for_codec(ip: IpAddr, port: u16, codec: &RtpCodecParameters) -> Self {
        Self::new(ip, port, codec.payload_type, codec.codec_name())
    }

    #[must_use]
    pub fn with_session_name(mut self, name: impl Into<String>) -> Self {
        self.session_name = name.into();
        self
    }

    #[must_use]
    pub fn render(&self) -> String {
        let family = match self.ip {
            IpAddr::V4(_) => "IP4",
            IpAddr::V6(_) => "IP6",
        };
        let (ip, port, pt) = (self.ip, self.port, self.payload_type);

        let codec_lines = match self.codec_name.to_ascii_uppercase().as_str() {
            "H264" => format!(
                "a=rtpmap:{pt} H264/{VIDEO_CLOCK_RATE}\na=fmtp:{pt} profile-level-id={H264_PROFILE_LEVEL_ID}\n"
            ),
            name @ ("VP8" | "VP9") => format!("a=rtpmap:{pt} {name}/{VIDEO_CLOCK_RATE}\n"),
            _ => format!("a=rtpmap:{pt} {}/{VIDEO_CLOCK_RATE}\n", self.codec_name),
        };

        format!(
            "v=0\n\
             o=- 0 0 IN {family} {ip}\n\
             s={session}\n\
             c=IN {family} {ip}\n\
             t=0 0\n\
             m=video {port} RTP/AVP {pt}\n\
             {codec_lines}\
             a=sendonly\n",
            session = self.session_name,
        )
    }
}
