// Payload codecs.
//
// Every resource operation takes a codec that declares the media type it
// writes and checks the media type it reads. CBOR is the OCF default.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde::de::value::SeqDeserializer;

use crate::error::Error;
use crate::message::ContentFormat;

/// Encodes request bodies and decodes response bodies.
pub trait Codec: Send + Sync {
    /// Media type written into the request's Content-Format / Accept.
    fn content_format(&self) -> ContentFormat;

    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, Error>;

    /// Decode a body; `content_format` is what the peer declared, if anything.
    fn decode<T: DeserializeOwned>(
        &self,
        content_format: Option<ContentFormat>,
        body: &[u8],
    ) -> Result<T, Error>;
}

fn codec_error(content_format: ContentFormat, message: impl ToString) -> Error {
    Error::Codec {
        media_type: content_format.to_string(),
        message: message.to_string(),
    }
}

fn check_declared(
    expected: &[ContentFormat],
    declared: Option<ContentFormat>,
    ours: ContentFormat,
) -> Result<(), Error> {
    match declared {
        Some(cf) if !expected.contains(&cf) => Err(codec_error(
            ours,
            format!("cannot decode a {cf} payload"),
        )),
        _ => Ok(()),
    }
}

// ── CBOR ────────────────────────────────────────────────────────────

/// `application/vnd.ocf+cbor` (also accepts plain `application/cbor`).
#[derive(Debug, Clone, Copy, Default)]
pub struct CborCodec;

impl Codec for CborCodec {
    fn content_format(&self) -> ContentFormat {
        ContentFormat::APP_OCF_CBOR
    }

    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, Error> {
        let mut buf = Vec::new();
        ciborium::into_writer(value, &mut buf)
            .map_err(|e| codec_error(self.content_format(), e))?;
        Ok(buf)
    }

    fn decode<T: DeserializeOwned>(
        &self,
        content_format: Option<ContentFormat>,
        body: &[u8],
    ) -> Result<T, Error> {
        check_declared(
            &[ContentFormat::APP_OCF_CBOR, ContentFormat::APP_CBOR],
            content_format,
            self.content_format(),
        )?;
        ciborium::from_reader(body).map_err(|e| codec_error(self.content_format(), e))
    }
}

// ── JSON ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn content_format(&self) -> ContentFormat {
        ContentFormat::APP_JSON
    }

    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, Error> {
        serde_json::to_vec(value).map_err(|e| codec_error(self.content_format(), e))
    }

    fn decode<T: DeserializeOwned>(
        &self,
        content_format: Option<ContentFormat>,
        body: &[u8],
    ) -> Result<T, Error> {
        check_declared(
            &[ContentFormat::APP_JSON],
            content_format,
            self.content_format(),
        )?;
        serde_json::from_slice(body).map_err(|e| codec_error(self.content_format(), e))
    }
}

// ── Raw ─────────────────────────────────────────────────────────────

/// Bytes pass-through with a caller-chosen media type.
///
/// Encodes byte strings, text, or `Vec<u8>`/`[u8]` values verbatim and
/// decodes into anything that accepts a sequence of bytes (`Vec<u8>`).
#[derive(Debug, Clone, Copy)]
pub struct RawCodec {
    content_format: ContentFormat,
}

impl RawCodec {
    pub fn new(content_format: ContentFormat) -> Self {
        Self { content_format }
    }
}

impl Default for RawCodec {
    fn default() -> Self {
        Self::new(ContentFormat::APP_OCTET_STREAM)
    }
}

impl Codec for RawCodec {
    fn content_format(&self) -> ContentFormat {
        self.content_format
    }

    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, Error> {
        use ciborium::Value;

        let value = Value::serialized(value).map_err(|e| codec_error(self.content_format, e))?;
        match value {
            Value::Bytes(bytes) => Ok(bytes),
            Value::Text(text) => Ok(text.into_bytes()),
            Value::Array(items) => items
                .into_iter()
                .map(|item| match item {
                    Value::Integer(i) => u8::try_from(i).ok(),
                    _ => None,
                })
                .collect::<Option<Vec<u8>>>()
                .ok_or_else(|| codec_error(self.content_format, "array is not a byte sequence")),
            _ => Err(codec_error(
                self.content_format,
                "raw payloads must be bytes or text",
            )),
        }
    }

    fn decode<T: DeserializeOwned>(
        &self,
        _content_format: Option<ContentFormat>,
        body: &[u8],
    ) -> Result<T, Error> {
        let de = SeqDeserializer::<_, serde::de::value::Error>::new(body.iter().copied());
        T::deserialize(de).map_err(|e| codec_error(self.content_format, e))
    }
}
