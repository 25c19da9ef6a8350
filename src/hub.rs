//! HuggingFace Hub integration for downloading Orpheus and SNAC weights.
//!
//! The Orpheus checkpoints are gated, so every request carries an explicit
//! access token ([`HubCredential`]). The library never reads the environment
//! itself; the CLI takes the token from `--hf-token` or `HUGGINGFACE_TOKEN`.
//!
//! # Example
//!
//! ```rust,ignore
//! use orpheus_tts::hub::{HubCredential, HubOptions, ModelPaths};
//!
//! let credential = HubCredential::new(token)?;
//! let paths = ModelPaths::download(&HubOptions::new(credential))?;
//! let tts = OrpheusTTS::from_paths(&paths, device)?;
//! ```
//!
//! Network access needs the `hub` feature. [`ModelPaths::from_dir`] works
//! without it.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{OrpheusError, Result};

/// Default HuggingFace repositories.
pub mod model_ids {
    /// Fine-tuned Orpheus 3B (Llama-3.2 architecture, 156940-token vocabulary)
    pub const ORPHEUS: &str = "canopylabs/orpheus-3b-0.1-ft";

    /// SNAC 24 kHz codec configuration
    pub const SNAC_CONFIG: &str = "hubertsiuzdak/snac_24khz";

    /// SNAC 24 kHz weights converted to safetensors
    pub const SNAC_WEIGHTS: &str = "lmz/candle-snac";

    /// Weight file inside [`SNAC_WEIGHTS`]
    pub const SNAC_WEIGHTS_FILE: &str = "snac_24khz.safetensors";
}

/// A HuggingFace access token.
#[derive(Clone, PartialEq, Eq)]
pub struct HubCredential(String);

impl HubCredential {
    /// Wrap a token. Empty tokens are missing; tokens with inner whitespace
    /// are rejected.
    pub fn new(token: impl Into<String>) -> Result<Self> {
        let token = token.into();
        let token = token.trim();
        if token.is_empty() {
            return Err(OrpheusError::MissingCredential);
        }
        if token.chars().any(char::is_whitespace) {
            return Err(OrpheusError::InvalidCredential(
                "token contains whitespace".to_string(),
            ));
        }
        Ok(Self(token.to_string()))
    }

    /// `None` becomes [`OrpheusError::MissingCredential`].
    pub fn from_option(token: Option<String>) -> Result<Self> {
        token.map_or(Err(OrpheusError::MissingCredential), Self::new)
    }

    pub fn token(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for HubCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("HubCredential(****)")
    }
}

/// Retry and revision settings for downloads.
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    /// Git revision (branch, tag or commit)
    pub revision: String,
    /// Total attempts per request, the first one included
    pub max_attempts: u32,
    /// Wait after the first failed attempt; doubled after each further failure
    pub initial_backoff: Duration,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            revision: "main".to_string(),
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
        }
    }
}

/// Allow/ignore filename patterns. `*` matches any run of characters.
#[derive(Debug, Clone)]
pub struct FilePatterns {
    pub allow: Vec<String>,
    pub ignore: Vec<String>,
}

impl Default for FilePatterns {
    /// Model config and weight shards only. Tokenizer files are fetched on
    /// their own.
    fn default() -> Self {
        fn to_vec(patterns: &[&str]) -> Vec<String> {
            patterns.iter().map(|s| s.to_string()).collect()
        }
        Self {
            allow: to_vec(&[
                "config.json",
                "*.safetensors",
                "model.safetensors.index.json",
            ]),
            ignore: to_vec(&[
                "optimizer.pt",
                "pytorch_model.bin",
                "training_args.bin",
                "scheduler.pt",
                "tokenizer.json",
                "tokenizer_config.json",
                "special_tokens_map.json",
                "vocab.json",
                "merges.txt",
                "tokenizer.*",
            ]),
        }
    }
}

impl FilePatterns {
    /// True if `file` matches an allow pattern and no ignore pattern.
    pub fn matches(&self, file: &str) -> bool {
        self.allow.iter().any(|p| wildcard_match(p, file))
            && !self.ignore.iter().any(|p| wildcard_match(p, file))
    }

    /// Keep the matching files, preserving order.
    pub fn filter<'a, I>(&self, files: I) -> Vec<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        files
            .into_iter()
            .filter(|f| self.matches(f))
            .map(str::to_string)
            .collect()
    }
}

fn wildcard_match(pattern: &str, text: &str) -> bool {
    let p = pattern.as_bytes();
    let t = text.as_bytes();
    let (mut pi, mut ti) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && p[pi] == b'*' {
            star = Some((pi, ti));
            pi += 1;
        } else if pi < p.len() && p[pi] == t[ti] {
            pi += 1;
            ti += 1;
        } else if let Some((sp, st)) = star {
            // backtrack: let the last star absorb one more character
            pi = sp + 1;
            ti = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    p[pi..].iter().all(|&c| c == b'*')
}

/// HTTP status carried by a hub error message, if it is 401 or 403.
///
/// Request errors render as `"{url}: status code {code}"`.
fn auth_status(message: &str) -> Option<u16> {
    let (_, rest) = message.rsplit_once("status code ")?;
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    match digits.parse::<u16>().ok()? {
        code @ (401 | 403) => Some(code),
        _ => None,
    }
}

/// Run `op` up to `config.max_attempts` times with exponential backoff.
///
/// A 401 or 403 response fails at once with
/// [`OrpheusError::InvalidCredential`]. Otherwise the final error becomes
/// [`OrpheusError::Download`] carrying the number of attempts made.
pub fn with_retry<T, E>(
    config: &DownloadConfig,
    repo: &str,
    file: &str,
    mut op: impl FnMut() -> std::result::Result<T, E>,
) -> Result<T>
where
    E: std::fmt::Display,
{
    let attempts = config.max_attempts.max(1);
    let mut backoff = config.initial_backoff;
    let mut attempt = 0;
    loop {
        attempt += 1;
        let message = match op() {
            Ok(value) => return Ok(value),
            Err(e) => e.to_string(),
        };
        if let Some(code) = auth_status(&message) {
            return Err(OrpheusError::InvalidCredential(format!(
                "{repo}/{file} rejected the token (HTTP {code})"
            )));
        }
        if attempt >= attempts {
            return Err(OrpheusError::Download {
                repo: repo.to_string(),
                file: file.to_string(),
                attempts: attempt,
                source: message.into(),
            });
        }
        tracing::warn!(
            "Download attempt {} failed for {}/{}: {}; retrying in {:?}",
            attempt,
            repo,
            file,
            message,
            backoff
        );
        std::thread::sleep(backoff);
        backoff *= 2;
    }
}

/// Files fetched from one repository.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub repo_id: String,
    /// Local cache paths, in repository listing order
    pub files: Vec<PathBuf>,
}

impl Snapshot {
    /// Path of the file whose name is exactly `name`.
    pub fn find(&self, name: &str) -> Option<&PathBuf> {
        self.files
            .iter()
            .find(|p| p.file_name().and_then(|n| n.to_str()) == Some(name))
    }

    /// All `.safetensors` files, sorted by name.
    pub fn safetensors(&self) -> Vec<PathBuf> {
        let mut shards: Vec<PathBuf> = self
            .files
            .iter()
            .filter(|p| p.extension().is_some_and(|e| e == "safetensors"))
            .cloned()
            .collect();
        shards.sort();
        shards
    }
}

#[cfg(any(feature = "hub", test))]
const LISTING: &str = "file listing";

/// Report a failed listing as [`OrpheusError::RepoListing`].
#[cfg(any(feature = "hub", test))]
fn listing_error(repo_id: &str, err: OrpheusError) -> OrpheusError {
    match err {
        OrpheusError::Download {
            attempts, source, ..
        } => OrpheusError::RepoListing {
            repo: repo_id.to_string(),
            reason: format!("{source} after {attempts} attempt(s)"),
        },
        other => other,
    }
}

#[cfg(feature = "hub")]
fn open_repo(
    repo_id: &str,
    credential: &HubCredential,
    config: &DownloadConfig,
) -> Result<hf_hub::api::sync::ApiRepo> {
    use hf_hub::api::sync::ApiBuilder;
    use hf_hub::{Repo, RepoType};

    let api = ApiBuilder::new()
        .with_token(Some(credential.token().to_string()))
        .build()
        .map_err(|e| OrpheusError::RepoListing {
            repo: repo_id.to_string(),
            reason: format!("failed to create HuggingFace API: {e}"),
        })?;
    Ok(api.repo(Repo::with_revision(
        repo_id.to_string(),
        RepoType::Model,
        config.revision.clone(),
    )))
}

/// Download the files of `repo_id` selected by `patterns`.
#[cfg(feature = "hub")]
pub fn snapshot_download(
    repo_id: &str,
    credential: &HubCredential,
    patterns: &FilePatterns,
    config: &DownloadConfig,
) -> Result<Snapshot> {
    let repo = open_repo(repo_id, credential, config)?;
    let info = with_retry(config, repo_id, LISTING, || repo.info())
        .map_err(|e| listing_error(repo_id, e))?;

    let selected = patterns.filter(info.siblings.iter().map(|s| s.rfilename.as_str()));
    tracing::info!(
        "Downloading {} of {} files from {}@{}",
        selected.len(),
        info.siblings.len(),
        repo_id,
        config.revision
    );

    let mut files = Vec::with_capacity(selected.len());
    for name in &selected {
        tracing::debug!("  {}", name);
        files.push(with_retry(config, repo_id, name, || repo.get(name))?);
    }

    Ok(Snapshot {
        repo_id: repo_id.to_string(),
        files,
    })
}

/// Download a single named file.
#[cfg(feature = "hub")]
pub fn download_file(
    repo_id: &str,
    file: &str,
    credential: &HubCredential,
    config: &DownloadConfig,
) -> Result<PathBuf> {
    let repo = open_repo(repo_id, credential, config)?;
    with_retry(config, repo_id, file, || repo.get(file))
}

/// Everything [`ModelPaths::download`] needs.
#[derive(Debug, Clone)]
pub struct HubOptions {
    pub model_id: String,
    pub credential: HubCredential,
    pub download: DownloadConfig,
    pub patterns: FilePatterns,
}

impl HubOptions {
    /// Defaults for the fine-tuned Orpheus checkpoint.
    pub fn new(credential: HubCredential) -> Self {
        Self {
            model_id: model_ids::ORPHEUS.to_string(),
            credential,
            download: DownloadConfig::default(),
            patterns: FilePatterns::default(),
        }
    }
}

/// Local paths of every file the pipeline loads.
#[derive(Debug, Clone)]
pub struct ModelPaths {
    /// LM `config.json`
    pub config: PathBuf,
    /// LM weight shards
    pub weights: Vec<PathBuf>,
    /// `tokenizer.json`
    pub tokenizer: PathBuf,
    /// SNAC `config.json`
    pub codec_config: PathBuf,
    /// SNAC safetensors
    pub codec_weights: PathBuf,
}

impl ModelPaths {
    /// Download the LM snapshot, its tokenizer and the SNAC codec.
    #[cfg(feature = "hub")]
    pub fn download(options: &HubOptions) -> Result<Self> {
        let credential = &options.credential;
        tracing::info!("Downloading Orpheus model files...");

        tracing::info!("  Language model: {}", options.model_id);
        let snapshot = snapshot_download(
            &options.model_id,
            credential,
            &options.patterns,
            &options.download,
        )?;
        let config = snapshot
            .find("config.json")
            .cloned()
            .ok_or_else(|| OrpheusError::RepoListing {
                repo: options.model_id.clone(),
                reason: "snapshot has no config.json".to_string(),
            })?;
        let weights = snapshot.safetensors();
        if weights.is_empty() {
            return Err(OrpheusError::RepoListing {
                repo: options.model_id.clone(),
                reason: "snapshot has no safetensors weights".to_string(),
            });
        }

        tracing::info!("  Tokenizer: {}", options.model_id);
        let tokenizer = download_file(
            &options.model_id,
            "tokenizer.json",
            credential,
            &options.download,
        )?;

        // The codec repos have no revision pinned alongside the LM
        let codec_download = DownloadConfig {
            revision: "main".to_string(),
            ..options.download.clone()
        };
        tracing::info!("  Codec: {}", model_ids::SNAC_CONFIG);
        let codec_config = download_file(
            model_ids::SNAC_CONFIG,
            "config.json",
            credential,
            &codec_download,
        )?;
        let codec_weights = download_file(
            model_ids::SNAC_WEIGHTS,
            model_ids::SNAC_WEIGHTS_FILE,
            credential,
            &codec_download,
        )?;

        tracing::info!("Download complete!");
        Ok(Self {
            config,
            weights,
            tokenizer,
            codec_config,
            codec_weights,
        })
    }

    /// Use a pre-downloaded model directory.
    ///
    /// Expected layout: `config.json`, `tokenizer.json` and `*.safetensors`
    /// shards at the top level, the codec under `snac/` as `config.json` plus
    /// `snac_24khz.safetensors`.
    pub fn from_dir<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        let require = |path: PathBuf| -> Result<PathBuf> {
            if path.is_file() {
                Ok(path)
            } else {
                Err(OrpheusError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("missing model file: {}", path.display()),
                )))
            }
        };

        let mut weights = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_file() && path.extension().is_some_and(|e| e == "safetensors") {
                weights.push(path);
            }
        }
        weights.sort();
        if weights.is_empty() {
            return Err(OrpheusError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no safetensors weights in {}", dir.display()),
            )));
        }

        Ok(Self {
            config: require(dir.join("config.json"))?,
            weights,
            tokenizer: require(dir.join("tokenizer.json"))?,
            codec_config: require(dir.join("snac").join("config.json"))?,
            codec_weights: require(dir.join("snac").join(model_ids::SNAC_WEIGHTS_FILE))?,
        })
    }
}
