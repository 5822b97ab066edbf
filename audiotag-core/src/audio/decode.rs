//! In-memory audio decoding via symphonia.
//!
//! The container is probed from the byte stream itself; an optional
//! extension hint (usually taken from the source URL) speeds up probing.

use std::io::Cursor;

use symphonia::core::{
    audio::SampleBuffer, codecs::DecoderOptions, errors::Error, formats::FormatOptions,
    io::MediaSourceStream, meta::MetadataOptions, probe::Hint,
};
use tracing::debug;

use super::DecodedAudio;
use crate::error::{AudiotagError, Result};

/// Decode encoded audio bytes into interleaved `f32` samples.
///
/// Returns `AudiotagError::Decode` when the bytes cannot be probed or decoded.
/// An empty but well-formed stream decodes to zero samples; callers decide
/// whether that is an error.
pub fn decode_bytes(bytes: &[u8], extension_hint: Option<&str>) -> Result<DecodedAudio> {
    let mss = MediaSourceStream::new(Box::new(Cursor::new(bytes.to_vec())), Default::default());
    let mut hint = Hint::new();
    if let Some(ext) = extension_hint {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|err| AudiotagError::Decode(format!("probe failed: {err}")))?;
    let mut format = probed.format;
    let track = format
        .default_track()
        .ok_or_else(|| AudiotagError::Decode("no default track".into()))?;
    let track_id = track.id;
    let codec_params = track.codec_params.clone();
    let mut sample_rate = codec_params.sample_rate.unwrap_or(0);
    let mut channels = codec_params.channels.map(|c| c.count() as u16).unwrap_or(0);

    let mut decoder = symphonia::default::get_codecs()
        .make(&codec_params, &DecoderOptions::default())
        .map_err(|err| AudiotagError::Decode(format!("unsupported codec: {err}")))?;

    let mut samples = Vec::new();
    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(Error::IoError(_)) => break,
            Err(Error::ResetRequired) => break,
            Err(err) => {
                return Err(AudiotagError::Decode(format!("packet read failed: {err}")));
            }
        };
        if packet.track_id() != track_id {
            continue;
        }
        let audio_buf = match decoder.decode(&packet) {
            Ok(audio_buf) => audio_buf,
            Err(Error::DecodeError(err)) => {
                debug!(error = %err, "skipping undecodable packet");
                continue;
            }
            Err(err) => {
                return Err(AudiotagError::Decode(format!("decode failed: {err}")));
            }
        };
        let spec = *audio_buf.spec();
        if sample_rate == 0 {
            sample_rate = spec.rate;
        }
        if channels == 0 {
            channels = spec.channels.count() as u16;
        }
        let mut sample_buf = SampleBuffer::<f32>::new(audio_buf.capacity() as u64, spec);
        sample_buf.copy_interleaved_ref(audio_buf);
        samples.extend_from_slice(sample_buf.samples());
    }

    if sample_rate == 0 {
        return Err(AudiotagError::Decode("missing sample rate".into()));
    }

    debug!(
        samples = samples.len(),
        sample_rate, channels, "decoded audio stream"
    );

    Ok(DecodedAudio {
        samples,
        sample_rate,
        channels: channels.max(1),
    })
}

/// Best-effort file extension from a URL path, ignoring query strings.
pub fn extension_from_url(url: &str) -> Option<&str> {
    let path = url.split(['?', '#']).next()?;
    let last = path.rsplit('/').next()?;
    let (_, ext) = last.rsplit_once('.')?;
    (!ext.is_empty() && ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .then_some(ext)
}
