use crate::config::CaptureConfig;
use std::collections::BTreeMap;

/// Container flags enabling playable output even when a capture is cut
/// short mid-write.
pub(crate) const MOVFLAGS: &str = "faststart+frag_keyframe+empty_moov";

/// Build the argument vector for one capture-process invocation.
///
/// Shape: `-y -headers <blob> [extra args] -i <url> -c copy [output flags]`.
/// Segmenting flags are appended only when a positive segment duration is
/// configured; the vector always ends with the output path.
pub fn build_capture_args(stream_url: &str, capture: &CaptureConfig) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-y".to_string(),
        "-headers".to_string(),
        header_blob(&capture.headers),
    ];

    args.extend(capture.extra_args.iter().cloned());

    args.extend([
        "-i".to_string(),
        stream_url.to_string(),
        "-c".to_string(),
        "copy".to_string(),
    ]);

    match capture.segment {
        Some(seconds) if seconds > 0 => {
            args.extend([
                "-f".to_string(),
                "segment".to_string(),
                "-segment_time".to_string(),
                seconds.to_string(),
                "-reset_timestamps".to_string(),
                "1".to_string(),
                "-movflags".to_string(),
                MOVFLAGS.to_string(),
                capture.output_path(),
            ]);
        }
        _ => {
            args.extend([
                "-movflags".to_string(),
                MOVFLAGS.to_string(),
                capture.output_path(),
            ]);
        }
    }

    args
}

/// Serialize forwarded headers as a single CRLF-joined `Key: Value` blob,
/// the form the capture binary expects for its `-headers` flag.
pub(crate) fn header_blob(headers: &BTreeMap<String, String>) -> String {
    headers
        .iter()
        .map(|(key, value)| format!("{}: {}\r\n", key, value))
        .collect()
}
