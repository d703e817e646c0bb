//! Encoder command generation
//!
//! Translates a handling profile into an ffmpeg argument list. The live path
//! always produces MPEG-TS on stdout; the preview path may remux to a
//! fragmented MP4 that browsers accept.

use base64::Engine as _;
use tracing::debug;

use crate::analyzer::{HandlingMethod, HandlingProfile, PlaylistComplexity};
use crate::models::{ChannelStream, StreamFormat};

/// Container produced on stdout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// `video/mp2t` for the live tuner path.
    MpegTs,
    /// Fragmented MP4 for browser preview playback.
    WebCompat,
}

/// Service for building encoder command arguments.
pub struct EncoderCommandBuilder;

impl EncoderCommandBuilder {
    /// Build the full argument list for one session.
    pub fn build_args(
        profile: &HandlingProfile,
        stream: &ChannelStream,
        input_url: &str,
        output: OutputFormat,
    ) -> Vec<String> {
        // stdin stays open: the graceful stop path writes `q` to it.
        let mut args: Vec<String> = vec![
            "-hide_banner".into(),
            "-loglevel".into(),
            "warning".into(),
        ];

        Self::add_input_args(&mut args, profile, stream, input_url);
        Self::add_output_args(&mut args, profile, output);

        debug!(
            channel_id = %stream.channel_id,
            method = ?profile.primary_method(),
            argc = args.len(),
            "built encoder command"
        );
        args
    }

    fn add_input_args(
        args: &mut Vec<String>,
        profile: &HandlingProfile,
        stream: &ChannelStream,
        input_url: &str,
    ) {
        match profile.kind {
            StreamFormat::Rtsp => {
                // TCP transport avoids lossy UDP interleaving on flaky links.
                args.extend(["-rtsp_transport".into(), "tcp".into()]);
            }
            StreamFormat::Hls | StreamFormat::Dash | StreamFormat::Ts | StreamFormat::Http => {
                if profile.is_cdn_backed {
                    args.extend([
                        "-http_persistent".into(),
                        "1".into(),
                        "-multiple_requests".into(),
                        "1".into(),
                    ]);
                }
                if profile.playlist_complexity == PlaylistComplexity::Complex
                    || profile
                        .supported_methods
                        .contains(&HandlingMethod::EnhancedRecovery)
                {
                    args.extend([
                        "-reconnect".into(),
                        "1".into(),
                        "-reconnect_at_eof".into(),
                        "1".into(),
                        "-reconnect_streamed".into(),
                        "1".into(),
                        "-reconnect_delay_max".into(),
                        "2".into(),
                    ]);
                }
                let headers = Self::request_headers(stream);
                if !headers.is_empty() {
                    args.extend(["-headers".into(), headers]);
                }
            }
            StreamFormat::Rtmp | StreamFormat::Udp | StreamFormat::Mms | StreamFormat::Srt => {}
        }

        args.extend([
            "-analyzeduration".into(),
            "10000000".into(),
            "-probesize".into(),
            "10000000".into(),
            "-i".into(),
            input_url.into(),
        ]);
    }

    fn add_output_args(args: &mut Vec<String>, profile: &HandlingProfile, output: OutputFormat) {
        match output {
            OutputFormat::MpegTs => {
                // Token-auth + complex sources get a minimal-copy pipeline:
                // nothing beyond the container is touched.
                args.extend(["-c".into(), "copy".into()]);
                if profile.primary_method() != HandlingMethod::MasterPlaylistDirect {
                    args.extend(["-map".into(), "0".into(), "-copy_unknown".into()]);
                }
                args.extend([
                    "-f".into(),
                    "mpegts".into(),
                    "-mpegts_copyts".into(),
                    "1".into(),
                    "pipe:1".into(),
                ]);
            }
            OutputFormat::WebCompat => {
                args.extend([
                    "-c:v".into(),
                    "libx264".into(),
                    "-preset".into(),
                    "veryfast".into(),
                    "-c:a".into(),
                    "aac".into(),
                    "-movflags".into(),
                    "frag_keyframe+empty_moov".into(),
                    "-f".into(),
                    "mp4".into(),
                    "pipe:1".into(),
                ]);
            }
        }
    }

    /// CRLF-joined request headers: custom headers first, then basic auth.
    fn request_headers(stream: &ChannelStream) -> String {
        let mut lines: Vec<String> = stream
            .headers
            .iter()
            .map(|(name, value)| format!("{name}: {value}"))
            .collect();
        lines.sort();

        if let (Some(user), Some(pass)) = (&stream.username, &stream.password) {
            let encoded =
                base64::engine::general_purpose::STANDARD.encode(format!("{user}:{pass}"));
            lines.push(format!("Authorization: Basic {encoded}"));
        }

        if lines.is_empty() {
            String::new()
        } else {
            // ffmpeg requires a trailing CRLF after the final header.
            format!("{}\r\n", lines.join("\r\n"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::Confidence;
    use std::collections::HashMap;

    fn profile(kind: StreamFormat, methods: Vec<HandlingMethod>) -> HandlingProfile {
        HandlingProfile {
            kind,
            requires_special_handling: false,
            has_token_auth: false,
            is_cdn_backed: false,
            has_redirects: false,
            playlist_complexity: PlaylistComplexity::Simple,
            supported_methods: methods,
            confidence: Confidence::High,
        }
    }

    fn hls_stream() -> ChannelStream {
        ChannelStream {
            channel_id: "ch-1".into(),
            url: "http://upstream/live.m3u8".into(),
            format: StreamFormat::Hls,
            backup_urls: vec![],
            username: None,
            password: None,
            headers: HashMap::new(),
            options: HashMap::new(),
            enabled: true,
        }
    }

    #[test]
    fn live_output_is_mpegts_on_stdout() {
        let p = profile(StreamFormat::Hls, vec![HandlingMethod::StandardProxy]);
        let args =
            EncoderCommandBuilder::build_args(&p, &hls_stream(), &hls_stream().url, OutputFormat::MpegTs);
        assert!(args.windows(2).any(|w| w == ["-f", "mpegts"]));
        assert_eq!(args.last().unwrap(), "pipe:1");
        assert!(args.windows(2).any(|w| w == ["-c", "copy"]));
    }

    #[test]
    fn rtsp_forces_tcp_transport() {
        let p = profile(StreamFormat::Rtsp, vec![HandlingMethod::StandardProxy]);
        let mut stream = hls_stream();
        stream.url = "rtsp://cam.local/ch0".into();
        stream.format = StreamFormat::Rtsp;
        let args =
            EncoderCommandBuilder::build_args(&p, &stream, &stream.url, OutputFormat::MpegTs);
        assert!(args.windows(2).any(|w| w == ["-rtsp_transport", "tcp"]));
    }

    #[test]
    fn complex_playlists_enable_reconnect() {
        let mut p = profile(StreamFormat::Hls, vec![HandlingMethod::EnhancedRecovery]);
        p.playlist_complexity = PlaylistComplexity::Complex;
        let args = EncoderCommandBuilder::build_args(
            &p,
            &hls_stream(),
            &hls_stream().url,
            OutputFormat::MpegTs,
        );
        assert!(args.windows(2).any(|w| w == ["-reconnect_at_eof", "1"]));
    }

    #[test]
    fn cdn_profiles_enable_persistent_http() {
        let mut p = profile(StreamFormat::Hls, vec![HandlingMethod::SegmentProxy]);
        p.is_cdn_backed = true;
        let args = EncoderCommandBuilder::build_args(
            &p,
            &hls_stream(),
            &hls_stream().url,
            OutputFormat::MpegTs,
        );
        assert!(args.windows(2).any(|w| w == ["-http_persistent", "1"]));
    }

    #[test]
    fn basic_auth_becomes_authorization_header() {
        let p = profile(StreamFormat::Hls, vec![HandlingMethod::StandardProxy]);
        let mut stream = hls_stream();
        stream.username = Some("user".into());
        stream.password = Some("pass".into());
        let args =
            EncoderCommandBuilder::build_args(&p, &stream, &stream.url, OutputFormat::MpegTs);
        let header_idx = args.iter().position(|a| a == "-headers").unwrap();
        assert!(args[header_idx + 1].starts_with("Authorization: Basic "));
    }

    #[test]
    fn preview_remux_targets_fragmented_mp4() {
        let p = profile(StreamFormat::Ts, vec![HandlingMethod::StandardProxy]);
        let args = EncoderCommandBuilder::build_args(
            &p,
            &hls_stream(),
            "http://upstream/feed.ts",
            OutputFormat::WebCompat,
        );
        assert!(args.windows(2).any(|w| w == ["-f", "mp4"]));
        assert!(args.windows(2).any(|w| w == ["-c:v", "libx264"]));
    }
}
