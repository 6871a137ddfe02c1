//! Data ingestion: fetch the image archive and unpack it.

use std::fs::{self, File};
use std::io::{self, BufWriter};
use std::path::PathBuf;
use std::time::Duration;

use chest_core::{get_size, DataIngestionConfig, Error, Result};
use indicatif::{ProgressBar, ProgressStyle};
use reqwest::blocking::Client;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use tracing::info;

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(600);

/// What [`DataIngestion::download_file`] did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    Downloaded { bytes: u64 },
    AlreadyPresent { size: String },
}

pub struct DataIngestion {
    config: DataIngestionConfig,
    client: Client,
}

impl DataIngestion {
    pub fn new(config: DataIngestionConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(DOWNLOAD_TIMEOUT)
            .user_agent(concat!("chest-pipeline/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Download(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self { config, client })
    }

    pub fn config(&self) -> &DataIngestionConfig {
        &self.config
    }

    /// Downloads the archive unless `local_data_file` already exists.
    pub fn download_file(&self) -> Result<DownloadOutcome> {
        let target = &self.config.local_data_file;
        if target.exists() {
            let size = get_size(target)?;
            info!("File already exists of size: {}", size);
            return Ok(DownloadOutcome::AlreadyPresent { size });
        }

        if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let url = &self.config.source_url;
        info!("Downloading {}", url);
        let response = self
            .client
            .get(url)
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(|e| Error::Download(format!("{url}: {e}")))?;

        let headers = response.headers();
        info!(
            "{} download! with following info: content-type={:?}, content-length={:?}",
            target.display(),
            headers.get(CONTENT_TYPE),
            headers.get(CONTENT_LENGTH)
        );

        let progress = match response.content_length() {
            Some(len) => {
                let pb = ProgressBar::new(len);
                if let Ok(style) = ProgressStyle::default_bar()
                    .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes}")
                {
                    pb.set_style(style.progress_chars("#>-"));
                }
                pb
            }
            None => ProgressBar::new_spinner(),
        };

        // Write next to the target first so an interrupted download is not
        // mistaken for a complete archive on the next run.
        let partial = partial_path(target);
        let bytes = {
            let mut reader = progress.wrap_read(response);
            let mut writer = BufWriter::new(File::create(&partial)?);
            let copied = io::copy(&mut reader, &mut writer)
                .map_err(|e| Error::Download(format!("{url}: {e}")));
            match copied {
                Ok(bytes) => bytes,
                Err(e) => {
                    drop(writer);
                    let _ = fs::remove_file(&partial);
                    return Err(e);
                }
            }
        };
        progress.finish_and_clear();
        fs::rename(&partial, target)?;

        info!("Downloaded {} bytes to {}", bytes, target.display());
        Ok(DownloadOutcome::Downloaded { bytes })
    }

    /// Extracts the archive into `unzip_dir` and returns the entry count.
    pub fn extract_zip_file(&self) -> Result<usize> {
        let unzip_dir = &self.config.unzip_dir;
        fs::create_dir_all(unzip_dir)?;

        let file = File::open(&self.config.local_data_file).map_err(|e| {
            Error::Archive(format!(
                "{}: {e}",
                self.config.local_data_file.display()
            ))
        })?;
        let mut archive = zip::ZipArchive::new(file)?;
        let entries = archive.len();
        archive.extract(unzip_dir)?;

        info!("Extracted {} entries into {}", entries, unzip_dir.display());
        Ok(entries)
    }
}

fn partial_path(target: &std::path::Path) -> PathBuf {
    let mut name = target.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}
