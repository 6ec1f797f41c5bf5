use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;
use std::time::Duration;

use tracing::info;

use super::error::InferenceError;

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(60 * 60);
const CHUNK_BYTES: usize = 64 * 1024;

/// Progress of one file download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadProgress {
    pub downloaded: u64,
    pub total: Option<u64>,
}

impl DownloadProgress {
    pub fn percent(&self) -> Option<u8> {
        self.total
            .filter(|total| *total > 0)
            .map(|total| ((self.downloaded.min(total) * 100) / total) as u8)
    }
}

/// Streams `url` into `dest` through a `.part` sibling so an interrupted
/// download never leaves a truncated file under the final name.
pub fn download_file(
    url: &str,
    dest: &Path,
    on_progress: &mut dyn FnMut(DownloadProgress),
) -> Result<u64, InferenceError> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)
            .map_err(|err| InferenceError::io(format!("create {}", parent.display()), err))?;
    }

    let config = ureq::Agent::config_builder()
        .timeout_global(Some(DOWNLOAD_TIMEOUT))
        .build();
    let agent = ureq::Agent::new_with_config(config);

    info!(url, dest = %dest.display(), "downloading");
    let mut response = agent.get(url).call().map_err(|err| InferenceError::Download {
        url: url.to_string(),
        detail: err.to_string(),
    })?;

    let total = response
        .headers()
        .get("content-length")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok());

    let part_path = dest.with_extension("part");
    let mut file = File::create(&part_path)
        .map_err(|err| InferenceError::io(format!("create {}", part_path.display()), err))?;

    let mut reader = response.body_mut().as_reader();
    let mut buf = vec![0_u8; CHUNK_BYTES];
    let mut downloaded = 0_u64;
    let mut last_percent = None;
    on_progress(DownloadProgress { downloaded, total });

    loop {
        let count = reader.read(&mut buf).map_err(|err| InferenceError::Download {
            url: url.to_string(),
            detail: err.to_string(),
        })?;
        if count == 0 {
            break;
        }
        file.write_all(&buf[..count])
            .map_err(|err| InferenceError::io(format!("write {}", part_path.display()), err))?;
        downloaded += count as u64;

        let progress = DownloadProgress { downloaded, total };
        let percent = progress.percent();
        if percent.is_none() || percent != last_percent {
            last_percent = percent;
            on_progress(progress);
        }
    }

    file.sync_all()
        .map_err(|err| InferenceError::io(format!("sync {}", part_path.display()), err))?;
    drop(file);

    if let Some(expected) = total.filter(|expected| *expected != downloaded) {
        let _ = fs::remove_file(&part_path);
        return Err(InferenceError::Download {
            url: url.to_string(),
            detail: format!("expected {expected} bytes, received {downloaded}"),
        });
    }

    fs::rename(&part_path, dest)
        .map_err(|err| InferenceError::io(format!("move {} into place", dest.display()), err))?;
    info!(url, bytes = downloaded, "download complete");
    Ok(downloaded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_is_clamped_and_optional() {
        let unknown = DownloadProgress {
            downloaded: 10,
            total: None,
        };
        assert_eq!(unknown.percent(), None);

        let half = DownloadProgress {
            downloaded: 50,
            total: Some(100),
        };
        assert_eq!(half.percent(), Some(50));

        let over = DownloadProgress {
            downloaded: 150,
            total: Some(100),
        };
        assert_eq!(over.percent(), Some(100));
    }
}
