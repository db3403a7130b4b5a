//! Client for the official NovelAI image API.
//!
//! Unlike the generation server this API wants a bearer token and answers with a
//! zip archive holding the image.

use reqwest::{
    header::{self, HeaderValue},
    Client,
};
use serde::Serialize;
use std::{
    io::{Cursor, Read},
    time::Duration,
};
use zip::ZipArchive;

use crate::{
    request::{GenerateRequest, Sampler, Schedule},
    GenError, Result,
};

const API_URL: &str = "https://api.novelai.net";
const DEFAULT_MODEL: &str = "nai-diffusion-3";
const ZIP_CONTENT_TYPE: &str = "application/x-zip-compressed";
const TIMEOUT: Duration = Duration::from_secs(3600);

/// The client used to interact with the NovelAI API. It has to be
/// [`configure`](NovelAiClient::configure)d with a token before generating.
#[derive(Debug, Clone)]
pub struct NovelAiClient {
    api: Client,
    base_url: String,
    model: String,
    token: Option<String>,
}

/// An image returned by the API, along with the exact payload that produced it
#[derive(Debug, Clone)]
pub struct VendorImage {
    pub data: Vec<u8>,
    pub payload: String,
}

impl NovelAiClient {
    pub fn new() -> Result<Self> {
        Ok(Self {
            api: build_client(None)?,
            base_url: API_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            token: None,
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn is_configured(&self) -> bool {
        self.token.is_some()
    }

    /// Installs `token` as the bearer for all following requests. Setting the
    /// same token again keeps the current connection pool.
    pub fn configure(&mut self, token: &str) -> Result<()> {
        if self.token.as_deref() == Some(token) {
            return Ok(());
        }

        self.api = build_client(Some(token))?;
        self.token = Some(token.to_string());
        Ok(())
    }

    /// Generate one image. A seed of -1 is replaced by a random one here since the
    /// API has no notion of "pick for me".
    pub async fn generate_image(&self, request: &GenerateRequest) -> Result<VendorImage> {
        if !self.is_configured() {
            return Err(GenError::NotConfigured);
        }
        request.validate()?;

        let payload = VendorPayload::new(request, &self.model);
        let res = self
            .api
            .post(format!("{}/ai/generate-image", self.base_url))
            .json(&payload)
            .send()
            .await
            .map_err(|e| GenError::from_transport(e, TIMEOUT))?;

        let status = res.status();
        let is_zip = res
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            == Some(ZIP_CONTENT_TYPE);

        if !is_zip {
            let message = res.text().await?;
            return Err(GenError::Response { status, message });
        }

        let archive = res.bytes().await?;
        let data = first_entry(&archive)?;
        tracing::debug!(bytes = data.len(), seed = payload.parameters.seed, "received image");

        Ok(VendorImage {
            data,
            payload: serde_json::to_string_pretty(&payload)?,
        })
    }
}

fn build_client(token: Option<&str>) -> Result<Client> {
    let mut headers = header::HeaderMap::new();

    if let Some(token) = token {
        let bearer = format!("Bearer {}", token);
        let mut key = HeaderValue::from_str(&bearer)?;
        key.set_sensitive(true);
        headers.insert(header::AUTHORIZATION, key);

        headers.insert(header::CONTENT_TYPE, "application/json".try_into()?);
        headers.insert(header::ORIGIN, "https://novelai.net".try_into()?);
        headers.insert(header::REFERER, "https://novelai.net/".try_into()?);
    }

    Ok(Client::builder()
        .default_headers(headers)
        .timeout(TIMEOUT)
        .build()?)
}

fn first_entry(archive: &[u8]) -> Result<Vec<u8>> {
    let mut zip = ZipArchive::new(Cursor::new(archive))?;
    if zip.len() == 0 {
        return Err(GenError::EmptyArchive);
    }

    let mut file = zip.by_index(0)?;
    // the header size is untrusted, let the buffer grow as data arrives
    let mut data = Vec::new();
    file.read_to_end(&mut data)?;
    Ok(data)
}

#[derive(Debug, Serialize)]
struct VendorPayload<'a> {
    action: &'static str,
    input: &'a str,
    model: &'a str,
    parameters: VendorParameters<'a>,
}

#[derive(Debug, Serialize)]
struct VendorParameters<'a> {
    width: u32,
    height: u32,
    scale: f64,
    sampler: Sampler,
    steps: u32,
    n_samples: u32,
    #[serde(rename = "ucPreset")]
    uc_preset: u32,
    add_original_image: bool,
    cfg_rescale: f64,
    controlnet_strength: u32,
    dynamic_thresholding: bool,
    legacy: bool,
    negative_prompt: &'a str,
    noise_schedule: Schedule,
    #[serde(rename = "qualityToggle")]
    quality_toggle: bool,
    seed: i64,
    sm: bool,
    sm_dyn: bool,
    uncond_scale: u32,
}

impl<'a> VendorPayload<'a> {
    fn new(request: &'a GenerateRequest, model: &'a str) -> Self {
        let seed = match request.seed() {
            -1 => i64::from(rand::random::<u32>()),
            seed => seed,
        };
        let dimensions = request.dimensions();

        Self {
            action: "generate",
            input: request.prompt(),
            model,
            parameters: VendorParameters {
                width: dimensions.width,
                height: dimensions.height,
                scale: request.scale(),
                sampler: request.sampler(),
                steps: request.steps(),
                n_samples: 1,
                uc_preset: 0,
                add_original_image: false,
                cfg_rescale: request.cfg_rescale(),
                controlnet_strength: 1,
                dynamic_thresholding: request.dyn_threshold(),
                legacy: false,
                negative_prompt: request.negative_prompt(),
                noise_schedule: request.schedule(),
                quality_toggle: request.quality_toggle(),
                seed,
                sm: request.smea(),
                sm_dyn: request.dyn_(),
                uncond_scale: 1,
            },
        }
    }
}
