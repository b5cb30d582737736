use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::{rngs::OsRng, Rng, RngCore};
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::CoreError;

/// Prefix every referral tracking code carries.
pub const TRACKING_PREFIX: &str = "UOB-";

const TRACKING_BODY_LEN: usize = 8;
const TRACKING_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const CHAIN_CODE_BYTES: usize = 9;

/// Characters escaped when a listing id is placed in a path segment.
const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// Fresh human-shareable chain code (12 URL-safe characters).
pub fn generate_chain_code() -> String {
    let mut bytes = [0u8; CHAIN_CODE_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Fresh `UOB-XXXXXXXX` tracking code.
pub fn generate_tracking_code() -> String {
    let mut rng = OsRng;
    let body: String = (0..TRACKING_BODY_LEN)
        .map(|_| TRACKING_ALPHABET[rng.gen_range(0..TRACKING_ALPHABET.len())] as char)
        .collect();
    format!("{TRACKING_PREFIX}{body}")
}

pub fn is_tracking_code(code: &str) -> bool {
    match code.strip_prefix(TRACKING_PREFIX) {
        Some(body) => {
            body.len() == TRACKING_BODY_LEN
                && body
                    .bytes()
                    .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit())
        }
        None => false,
    }
}

pub fn is_chain_code(code: &str) -> bool {
    code.len() == 12
        && code
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        && URL_SAFE_NO_PAD.decode(code).is_ok()
}

fn validate_tracking(code: &str) -> Result<(), CoreError> {
    if is_tracking_code(code) {
        Ok(())
    } else {
        Err(CoreError::InvalidCode(code.to_string()))
    }
}

/// Check that `base` can prefix rendered share links: an absolute http(s)
/// origin with no path, query or fragment.
pub fn validate_base_url(base: &str) -> Result<(), CoreError> {
    let invalid = || CoreError::InvalidShareUrl(base.to_string());
    let url = Url::parse(base.trim()).map_err(|_| invalid())?;
    if !matches!(url.scheme(), "http" | "https")
        || url.host_str().is_none()
        || url.path() != "/"
        || url.query().is_some()
        || url.fragment().is_some()
    {
        return Err(invalid());
    }
    Ok(())
}

/// The two link shapes a referral can travel as.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ShareLink {
    /// `<base>/listings/{listing_id}?ref={tracking_code}`
    Listing {
        listing_id: String,
        tracking_code: String,
    },
    /// `<base>/course/{listing_id}?chain={chain_code}&ref={referral_code}`
    Course {
        listing_id: String,
        chain_code: String,
        referral_code: String,
    },
}

impl ShareLink {
    pub fn render(&self, base: &str) -> String {
        let base = base.trim_end_matches('/');
        match self {
            ShareLink::Listing {
                listing_id,
                tracking_code,
            } => format!(
                "{base}/listings/{}?ref={tracking_code}",
                utf8_percent_encode(listing_id, PATH_SEGMENT)
            ),
            ShareLink::Course {
                listing_id,
                chain_code,
                referral_code,
            } => format!(
                "{base}/course/{}?chain={chain_code}&ref={referral_code}",
                utf8_percent_encode(listing_id, PATH_SEGMENT)
            ),
        }
    }

    /// Parse either link shape. The URL must be absolute http(s) with a path
    /// of exactly `/{kind}/{listing_id}`; the origin itself is not checked.
    pub fn parse(raw: &str) -> Result<Self, CoreError> {
        let invalid = || CoreError::InvalidShareUrl(raw.to_string());
        let url = Url::parse(raw.trim()).map_err(|_| invalid())?;
        if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
            return Err(invalid());
        }

        let segments: Vec<&str> = url
            .path_segments()
            .ok_or_else(invalid)?
            .filter(|s| !s.is_empty())
            .collect();
        let [kind, listing_id] = segments.as_slice() else {
            return Err(invalid());
        };
        let listing_id = percent_decode_str(listing_id)
            .decode_utf8()
            .map_err(|_| invalid())?
            .into_owned();

        let query = |key: &str| {
            url.query_pairs()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.into_owned())
                .filter(|v| !v.is_empty())
        };
        let reference = query("ref").ok_or_else(invalid)?;

        match (*kind, query("chain")) {
            ("listings", None) => {
                validate_tracking(&reference)?;
                Ok(ShareLink::Listing {
                    listing_id,
                    tracking_code: reference,
                })
            }
            ("course", Some(chain_code)) => {
                validate_tracking(&reference)?;
                if !is_chain_code(&chain_code) {
                    return Err(CoreError::InvalidCode(chain_code));
                }
                Ok(ShareLink::Course {
                    listing_id,
                    chain_code,
                    referral_code: reference,
                })
            }
            _ => Err(invalid()),
        }
    }

    pub fn listing_id(&self) -> &str {
        match self {
            ShareLink::Listing { listing_id, .. } | ShareLink::Course { listing_id, .. } => {
                listing_id
            }
        }
    }
}
