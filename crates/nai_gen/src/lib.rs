//! # nai_gen
//!
//! `nai_gen` is a library for requesting AI-generated images from a NovelAI-compatible
//! generation server. It builds the request payload, optionally expands `__wildcard__`
//! tokens in the prompt from a directory of tag files, fires a batch of requests and
//! hands back the image bytes. The closed choices of the server (samplers, schedules,
//! presets) are enums so invalid requests can't be built.
//!
//! The official NovelAI API and a WebP re-encoder that carries the generation
//! metadata along are available as separate entry points.
//!
//! ## Example
//!
//! Basic usage:
//!
//! ```no_run
//! # use nai_gen::prelude::*;
//! # async fn run() -> nai_gen::Result<()> {
//! let client = GenClient::new("127.0.0.1:7000")?;
//!
//! let mut cache = WildcardCache::new("./wildcards")?;
//! let prompt = wildcard::resolve("1girl, __hair__", &mut cache);
//!
//! let request = GenerateRequest::new(prompt)
//!     .update_sampler(Sampler::KEulerAncestral)
//!     .update_size(1216, 832);
//!
//! for result in client.run_batch(&request, "", 4).await {
//!     match result {
//!         Ok(image) => println!("got {} bytes", image.len()),
//!         Err(e) => eprintln!("{e}"),
//!     }
//! }
//! # Ok(())
//! # }
//! ```

use reqwest::{header, StatusCode};
use std::{path::PathBuf, time::Duration};
use thiserror::Error;

pub mod client;
pub mod novelai;
pub mod postprocess;
pub mod request;
pub mod wildcard;

pub mod prelude {
    pub use super::{
        client::GenClient,
        novelai::{NovelAiClient, VendorImage},
        postprocess::{encode_webp, EncodeOptions, SourceImage},
        request::{
            resolve_dimensions, AspectRatio, Dimensions, GenerateRequest, Sampler, Schedule,
            UcPreset,
        },
        wildcard::{self, TagLookup, WildcardCache},
        GenError,
    };
}

/// Potential errors returned from the library
#[derive(Error, Debug)]
pub enum GenError {
    /// Errors returned from the underlying reqwest library
    #[error("internal reqwest error: {0}")]
    ReqwestError(#[from] reqwest::Error),
    /// An invalid header
    #[error(transparent)]
    InvalidHeader(#[from] header::InvalidHeaderValue),
    /// The server answered with something other than an image
    #[error("server returned {status}: {message}")]
    Response { status: StatusCode, message: String },
    /// No response arrived within the budget
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    /// Sampler outside of the supported set
    #[error("invalid sampler {0:?}")]
    InvalidSampler(String),
    /// Schedule outside of the supported set
    #[error("invalid schedule {0:?}")]
    InvalidSchedule(String),
    /// Unknown negative prompt preset
    #[error("invalid uc preset {0:?}")]
    InvalidUcPreset(String),
    /// Unknown aspect ratio preset
    #[error("invalid aspect ratio {0:?}")]
    InvalidAspectRatio(String),
    /// A numeric parameter out of range
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),
    /// The wildcard directory is missing or not a directory
    #[error("wildcard dir {0:?} must be an existing directory")]
    WildcardDir(PathBuf),
    /// The vendor client was used before a token was configured
    #[error("no api token configured")]
    NotConfigured,
    /// The vendor returned an archive without any image in it
    #[error("the archive did not contain any image")]
    EmptyArchive,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Zip(#[from] zip::result::ZipError),
    #[error(transparent)]
    Image(#[from] image::ImageError),
    #[error(transparent)]
    Png(#[from] png::DecodingError),
    #[error(transparent)]
    Exif(#[from] exif::Error),
    #[error(transparent)]
    Container(#[from] img_parts::Error),
    #[error("webp encoding failed: {0}")]
    WebpEncode(String),
}

impl GenError {
    /// The HTTP status that produced this error, if the server answered at all
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Response { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Folds a reqwest timeout into [`GenError::Timeout`] so callers don't have to
    /// dig through the transport error to find out what happened
    pub(crate) fn from_transport(err: reqwest::Error, budget: Duration) -> Self {
        if err.is_timeout() {
            Self::Timeout(budget)
        } else {
            Self::ReqwestError(err)
        }
    }
}

pub type Result<T> = std::result::Result<T, GenError>;
