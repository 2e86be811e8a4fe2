use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::checkpoint::write_atomic;
use crate::error::MediaError;
use crate::retry::RetryPolicy;
use crate::source::{MediaDescriptor, Message, MessageSource};

/// Outcome of fetching one message's media.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaOutcome {
    Stored(PathBuf),
    NoMedia,
    /// The download failed; the record is still emitted without a path.
    Failed,
}

impl MediaOutcome {
    pub fn path(&self) -> Option<&Path> {
        match self {
            MediaOutcome::Stored(path) => Some(path),
            _ => None,
        }
    }
}

/// Deterministic file name for a message's media.
///
/// Photos are always stored as `.jpg`; documents take the MIME subtype as the
/// extension (`video/mp4` becomes `.mp4`). Downstream tooling recomputes these
/// names to locate media, so the scheme must not change.
pub fn media_filename(channel: &str, message_id: i64, media: &MediaDescriptor) -> Option<String> {
    match media {
        MediaDescriptor::None => None,
        MediaDescriptor::Photo => Some(format!("{}_{}.jpg", channel, message_id)),
        MediaDescriptor::Document { mime_type } => Some(format!(
            "{}_{}.{}",
            channel,
            message_id,
            mime_extension(mime_type)
        )),
    }
}

fn mime_extension(mime_type: &str) -> &str {
    let subtype = match mime_type.rsplit_once('/') {
        Some((_, subtype)) => subtype.trim(),
        None => "",
    };
    let unsafe_name = subtype.is_empty()
        || subtype == "."
        || subtype == ".."
        || subtype.contains(['/', '\\', '\0']);
    if unsafe_name {
        "bin"
    } else {
        subtype
    }
}

/// Downloads message media into a flat content directory.
pub struct MediaFetcher {
    content_dir: PathBuf,
    retry: RetryPolicy,
}

impl MediaFetcher {
    pub fn new(content_dir: impl Into<PathBuf>, retry: RetryPolicy) -> Self {
        Self {
            content_dir: content_dir.into(),
            retry,
        }
    }

    /// Fetch the media of `message`. Failures are logged and reported as
    /// `MediaOutcome::Failed`; they never propagate.
    pub async fn fetch(
        &self,
        source: &dyn MessageSource,
        channel: &str,
        message: &Message,
    ) -> MediaOutcome {
        let Some(filename) = media_filename(channel, message.id, &message.media) else {
            return MediaOutcome::NoMedia;
        };
        let path = self.content_dir.join(filename);

        match self.download_to(source, channel, message, &path).await {
            Ok(()) => MediaOutcome::Stored(path),
            Err(e) => {
                warn!(
                    "Media download failed for message ID {} of {}: {}",
                    message.id, channel, e
                );
                MediaOutcome::Failed
            }
        }
    }

    async fn download_to(
        &self,
        source: &dyn MessageSource,
        channel: &str,
        message: &Message,
        path: &Path,
    ) -> Result<(), MediaError> {
        if let Ok(meta) = tokio::fs::metadata(path).await {
            if meta.is_file() && meta.len() > 0 {
                debug!("Media already present: {}", path.display());
                return Ok(());
            }
        }

        let what = format!("media download for {} #{}", channel, message.id);
        let bytes = self
            .retry
            .run(&what, || source.download_media(channel, message))
            .await?;

        write_atomic(path, &bytes)
            .await
            .map_err(|source| MediaError::Write {
                path: path.to_path_buf(),
                source,
            })?;

        info!("Downloaded media for message ID {}.", message.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{message, FakeSource};

    #[test]
    fn test_photo_filename() {
        assert_eq!(
            media_filename("abc", 42, &MediaDescriptor::Photo).as_deref(),
            Some("abc_42.jpg")
        );
    }

    #[test]
    fn test_document_filename_uses_mime_subtype() {
        let doc = MediaDescriptor::Document {
            mime_type: "video/mp4".to_string(),
        };
        assert_eq!(media_filename("abc", 42, &doc).as_deref(), Some("abc_42.mp4"));

        let pdf = MediaDescriptor::Document {
            mime_type: "application/pdf".to_string(),
        };
        assert_eq!(media_filename("abc", 7, &pdf).as_deref(), Some("abc_7.pdf"));
    }

    #[test]
    fn test_no_media_has_no_filename() {
        assert_eq!(media_filename("abc", 42, &MediaDescriptor::None), None);
    }

    #[test]
    fn test_malformed_mime_falls_back_to_bin() {
        for mime in ["", "octet", "image/", "a/.."] {
            let doc = MediaDescriptor::Document {
                mime_type: mime.to_string(),
            };
            assert_eq!(
                media_filename("abc", 1, &doc).as_deref(),
                Some("abc_1.bin"),
                "mime {:?}",
                mime
            );
        }
    }

    #[tokio::test]
    async fn test_fetch_writes_deterministic_path() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = MediaFetcher::new(dir.path(), RetryPolicy::none());
        let source = FakeSource::new();
        let msg = message(42).with_media(MediaDescriptor::Photo);

        let outcome = fetcher.fetch(&source, "abc", &msg).await;

        let expected = dir.path().join("abc_42.jpg");
        assert_eq!(outcome, MediaOutcome::Stored(expected.clone()));
        assert_eq!(std::fs::read(expected).unwrap(), b"media:abc:42".to_vec());
    }

    #[tokio::test]
    async fn test_fetch_without_media_is_no_media() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = MediaFetcher::new(dir.path(), RetryPolicy::none());
        let source = FakeSource::new();

        let outcome = fetcher.fetch(&source, "abc", &message(1)).await;

        assert_eq!(outcome, MediaOutcome::NoMedia);
        assert_eq!(source.download_calls(), 0);
    }

    #[tokio::test]
    async fn test_existing_file_is_not_downloaded_again() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("abc_5.jpg"), b"cached").unwrap();
        let fetcher = MediaFetcher::new(dir.path(), RetryPolicy::none());
        let source = FakeSource::new();
        let msg = message(5).with_media(MediaDescriptor::Photo);

        let outcome = fetcher.fetch(&source, "abc", &msg).await;

        assert!(matches!(outcome, MediaOutcome::Stored(_)));
        assert_eq!(source.download_calls(), 0);
    }

    #[tokio::test]
    async fn test_failed_download_reports_failed() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = MediaFetcher::new(dir.path(), RetryPolicy::new(2, std::time::Duration::ZERO));
        let source = FakeSource::new();
        source.fail_media("abc", 9);
        let msg = message(9).with_media(MediaDescriptor::Photo);

        let outcome = fetcher.fetch(&source, "abc", &msg).await;

        assert_eq!(outcome, MediaOutcome::Failed);
        assert_eq!(source.download_calls(), 2);
        assert!(!dir.path().join("abc_9.jpg").exists());
    }
}
