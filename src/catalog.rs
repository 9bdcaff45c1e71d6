//! Track catalog: the audio assets a room can be created with.
//!
//! Assets are laid out as `audio/{composer}/{file}`. The composer is the
//! folder name and the title is derived from the file name by turning
//! underscores into spaces and dropping the extension.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::error::{ListeningRoomError, Result};
use crate::protocol::Track;

/// Root folder of the audio assets.
pub const CATALOG_ROOT: &str = "audio";

/// Composer used for assets stored directly under the catalog root.
pub const UNKNOWN_COMPOSER: &str = "Unknown";

/// Lists playable tracks from asset storage.
///
/// One call returns one complete listing; there are no incremental updates.
#[async_trait]
pub trait TrackCatalog: Send + Sync + 'static {
    async fn list(&self) -> Result<Vec<Track>>;
}

/// Build a [`Track`] from an asset path and its resolved URL.
///
/// # Errors
///
/// Returns [`ListeningRoomError::InvalidInput`] when the path has no file name.
///
/// # Example
///
/// ```
/// use listening_room::catalog::track_from_asset;
///
/// let track = track_from_asset("audio/Bach/Cello_Suite_1.mp3", "https://cdn/1.mp3").unwrap();
/// assert_eq!(track.composer, "Bach");
/// assert_eq!(track.title, "Cello Suite 1");
/// assert_eq!(track.asset_ref, "audio/Bach/Cello_Suite_1.mp3");
/// ```
pub fn track_from_asset(asset_path: &str, url: impl Into<String>) -> Result<Track> {
    let relative = asset_path
        .strip_prefix(CATALOG_ROOT)
        .and_then(|rest| rest.strip_prefix('/'))
        .unwrap_or(asset_path);
    let (folder, file) = match relative.rsplit_once('/') {
        Some((folder, file)) => (folder.rsplit('/').next().unwrap_or_default(), file),
        None => ("", relative),
    };
    if file.is_empty() {
        return Err(ListeningRoomError::InvalidInput(format!(
            "asset path has no file name: {asset_path}"
        )));
    }
    let stem = match file.rfind('.') {
        Some(dot) if dot > 0 => file.get(..dot).unwrap_or(file),
        _ => file,
    };
    let composer = if folder.is_empty() {
        UNKNOWN_COMPOSER
    } else {
        folder
    };
    Ok(Track {
        composer: composer.to_owned(),
        title: stem.replace('_', " "),
        asset_ref: asset_path.to_owned(),
        url: url.into(),
    })
}

/// Order tracks by composer folder, keeping the listing order inside a folder.
pub fn group_by_composer(tracks: Vec<Track>) -> Vec<Track> {
    let mut folders: BTreeMap<String, Vec<Track>> = BTreeMap::new();
    for track in tracks {
        folders.entry(track.composer.clone()).or_default().push(track);
    }
    folders.into_values().flatten().collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    #[test]
    fn title_drops_extension_and_underscores() {
        let track = track_from_asset("audio/Satie/Gymnopedie_No_1.ogg", "u").unwrap();
        assert_eq!(track.title, "Gymnopedie No 1");
        assert_eq!(track.composer, "Satie");
    }

    #[test]
    fn only_last_extension_is_dropped() {
        let track = track_from_asset("audio/X/live.2019.flac", "u").unwrap();
        assert_eq!(track.title, "live.2019");
    }

    #[test]
    fn root_level_assets_have_unknown_composer() {
        let track = track_from_asset("audio/intro.mp3", "u").unwrap();
        assert_eq!(track.composer, UNKNOWN_COMPOSER);
        assert_eq!(track.title, "intro");
    }

    #[test]
    fn directory_paths_are_rejected() {
        assert!(track_from_asset("audio/Bach/", "u").is_err());
    }

    #[test]
    fn grouping_is_by_composer_then_listing_order() {
        let tracks = vec![
            track_from_asset("audio/Satie/b.mp3", "u").unwrap(),
            track_from_asset("audio/Bach/z.mp3", "u").unwrap(),
            track_from_asset("audio/Satie/a.mp3", "u").unwrap(),
        ];
        let grouped = group_by_composer(tracks);
        let titles: Vec<_> = grouped.iter().map(|t| t.title.as_str()).collect();
        assert_eq!(titles, ["z", "b", "a"]);
    }
}
