use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{Error, Result};

/// Tolerance used when matching an unresolved track by duration.
const DURATION_TOLERANCE_MS: u64 = 1500;

/// Track metadata exactly as the node reports it.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackInfo {
    pub identifier: String,
    pub is_seekable: bool,
    pub author: String,
    /// Length in milliseconds.
    pub length: u64,
    pub is_stream: bool,
    #[serde(default)]
    pub position: u64,
    pub title: String,
    #[serde(default)]
    pub uri: Option<String>,
    #[serde(default)]
    pub source_name: Option<String>,
}

/// Encoded track plus its metadata, as returned by `/loadtracks` and `/decodetracks`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TrackData {
    #[serde(alias = "encoded")]
    pub track: String,
    pub info: TrackInfo,
}

/// A playable track.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Track {
    /// Opaque handle understood by the node.
    pub track: String,
    pub title: String,
    pub identifier: String,
    pub author: String,
    /// Duration in milliseconds.
    pub duration: u64,
    pub is_seekable: bool,
    pub is_stream: bool,
    pub uri: Option<String>,
    pub thumbnail: Option<String>,
    /// Whoever asked for the track. Never inspected by the manager.
    pub requester: Option<Value>,
}

impl Track {
    pub fn from_data(data: TrackData, requester: Option<Value>) -> Self {
        let thumbnail = data
            .info
            .uri
            .as_deref()
            .filter(|uri| uri.contains("youtube"))
            .map(|_| format!("https://img.youtube.com/vi/{}/default.jpg", data.info.identifier));

        Self {
            track: data.track,
            title: data.info.title,
            identifier: data.info.identifier,
            author: data.info.author,
            duration: data.info.length,
            is_seekable: data.info.is_seekable,
            is_stream: data.info.is_stream,
            uri: data.info.uri,
            thumbnail,
            requester,
        }
    }
}

/// A track known only by its metadata. Resolved through a search right
/// before it is played.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnresolvedTrack {
    pub title: String,
    pub author: Option<String>,
    /// Expected duration in milliseconds, used to pick among results.
    pub duration: Option<u64>,
    pub requester: Option<Value>,
}

impl UnresolvedTrack {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            author: None,
            duration: None,
            requester: None,
        }
    }

    pub fn author(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }

    pub fn duration(mut self, duration: u64) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn requester(mut self, requester: Value) -> Self {
        self.requester = Some(requester);
        self
    }

    fn query(&self) -> String {
        match self.author.as_deref().filter(|a| !a.is_empty()) {
            Some(author) => format!("{} - {}", author, self.title),
            None => self.title.clone(),
        }
    }

    /// Searches for this track and returns the closest match.
    ///
    /// Preference order: same author (or its "- Topic" channel) or same
    /// title, then a duration within 1.5 s, then the first result.
    pub async fn resolve(&self, searcher: &dyn TrackSearcher) -> Result<Track> {
        let query = self.query();
        debug!("Resolviendo track: {}", query);

        let result = searcher.search(&query, self.requester.clone()).await?;

        if result.load_type != LoadType::SearchResult {
            let message = result
                .exception
                .and_then(|e| e.message)
                .unwrap_or_else(|| "No tracks found.".to_string());
            return Err(Error::Resolve(message));
        }

        let mut tracks = result.tracks;

        if let Some(author) = self.author.as_deref() {
            let topic = format!("{} - Topic", author);
            if let Some(pos) = tracks.iter().position(|t| {
                t.author.eq_ignore_ascii_case(author)
                    || t.author.eq_ignore_ascii_case(&topic)
                    || t.title.eq_ignore_ascii_case(&self.title)
            }) {
                return Ok(tracks.swap_remove(pos));
            }
        }

        if let Some(duration) = self.duration {
            let min = duration.saturating_sub(DURATION_TOLERANCE_MS);
            let max = duration + DURATION_TOLERANCE_MS;
            if let Some(pos) = tracks.iter().position(|t| t.duration >= min && t.duration <= max) {
                return Ok(tracks.swap_remove(pos));
            }
        }

        if tracks.is_empty() {
            return Err(Error::Resolve("No tracks found.".to_string()));
        }

        Ok(tracks.swap_remove(0))
    }
}

/// An entry of the queue: either ready to play or still to be resolved.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum QueueTrack {
    Resolved(Track),
    Unresolved(UnresolvedTrack),
}

impl QueueTrack {
    pub fn title(&self) -> &str {
        match self {
            QueueTrack::Resolved(t) => &t.title,
            QueueTrack::Unresolved(t) => &t.title,
        }
    }

    pub fn duration(&self) -> Option<u64> {
        match self {
            QueueTrack::Resolved(t) => Some(t.duration),
            QueueTrack::Unresolved(t) => t.duration,
        }
    }

    pub fn as_resolved(&self) -> Option<&Track> {
        match self {
            QueueTrack::Resolved(t) => Some(t),
            QueueTrack::Unresolved(_) => None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, QueueTrack::Resolved(_))
    }
}

impl From<Track> for QueueTrack {
    fn from(track: Track) -> Self {
        QueueTrack::Resolved(track)
    }
}

impl From<UnresolvedTrack> for QueueTrack {
    fn from(track: UnresolvedTrack) -> Self {
        QueueTrack::Unresolved(track)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoadType {
    TrackLoaded,
    PlaylistLoaded,
    SearchResult,
    NoMatches,
    LoadFailed,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct LoadException {
    pub message: Option<String>,
    pub severity: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlaylistInfo {
    pub name: String,
    pub selected_track: Option<Track>,
    /// Sum of the playlist's track durations, in milliseconds.
    pub duration: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchResult {
    pub load_type: LoadType,
    pub tracks: Vec<Track>,
    pub playlist: Option<PlaylistInfo>,
    pub exception: Option<LoadException>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoadTracksResponse {
    load_type: LoadType,
    #[serde(default)]
    playlist_info: Option<RawPlaylistInfo>,
    #[serde(default)]
    tracks: Vec<TrackData>,
    #[serde(default)]
    exception: Option<LoadException>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPlaylistInfo {
    name: Option<String>,
    selected_track: Option<i64>,
}

impl SearchResult {
    /// Builds a result from the raw `/loadtracks` response.
    pub fn from_response(raw: Value, requester: Option<Value>) -> Result<Self> {
        let response: LoadTracksResponse = serde_json::from_value(raw)?;

        let tracks: Vec<Track> = response
            .tracks
            .into_iter()
            .map(|data| Track::from_data(data, requester.clone()))
            .collect();

        let playlist = match (response.load_type, response.playlist_info) {
            (LoadType::PlaylistLoaded, Some(info)) => Some(PlaylistInfo {
                name: info.name.unwrap_or_default(),
                selected_track: info
                    .selected_track
                    .and_then(|i| usize::try_from(i).ok())
                    .and_then(|i| tracks.get(i).cloned()),
                duration: tracks.iter().map(|t| t.duration).sum(),
            }),
            _ => None,
        };

        Ok(Self {
            load_type: response.load_type,
            tracks,
            playlist,
            exception: response.exception,
        })
    }
}

/// Anything able to run a track search on behalf of an unresolved track.
#[async_trait]
pub trait TrackSearcher: Send + Sync {
    async fn search(&self, query: &str, requester: Option<Value>) -> Result<SearchResult>;
}
