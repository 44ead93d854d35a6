use tracing::{debug, error};

use pvrd_mpeg::pes::{PADDING_STREAM, PRIVATE_STREAM_1, is_audio_stream, is_video_stream};

pub const MAX_AUDIO_TRACKS: usize = 32;
pub const MAX_DOLBY_TRACKS: usize = 16;

#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub enum TrackType {
    Audio(u8),
    Dolby(u8),
}

impl TrackType {
    pub fn is_dolby(&self) -> bool {
        matches!(self, Self::Dolby(_))
    }

    fn is_valid(&self) -> bool {
        match *self {
            Self::Audio(i) => (i as usize) < MAX_AUDIO_TRACKS,
            Self::Dolby(i) => (i as usize) < MAX_DOLBY_TRACKS,
        }
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Track {
    /// A PID for live view, a stream id when replaying.
    pub id: u16,
    pub language: String,
}

/// The audio tracks known on a device, and which one is being played.
#[derive(Clone, Debug)]
pub struct Tracks {
    audio: Vec<Track>,
    dolby: Vec<Track>,
    current: TrackType,
    missing_count: usize,
}

impl Default for Tracks {
    fn default() -> Self {
        Self::new()
    }
}

impl Tracks {
    pub fn new() -> Self {
        Self {
            audio: vec![Track::default(); MAX_AUDIO_TRACKS],
            dolby: vec![Track::default(); MAX_DOLBY_TRACKS],
            current: TrackType::Audio(0),
            missing_count: 0,
        }
    }

    pub fn clear(&mut self) {
        self.audio.fill(Track::default());
        self.dolby.fill(Track::default());
        self.missing_count = 0;
    }

    fn slot(&self, track_type: TrackType) -> Option<&Track> {
        match track_type {
            TrackType::Audio(i) => self.audio.get(i as usize),
            TrackType::Dolby(i) => self.dolby.get(i as usize),
        }
    }

    fn slot_mut(&mut self, track_type: TrackType) -> Option<&mut Track> {
        match track_type {
            TrackType::Audio(i) => self.audio.get_mut(i as usize),
            TrackType::Dolby(i) => self.dolby.get_mut(i as usize),
        }
    }

    /// The track of the given type, if it has been made available.
    pub fn get(&self, track_type: TrackType) -> Option<&Track> {
        self.slot(track_type).filter(|track| track.id != 0)
    }

    pub fn len(&self) -> usize {
        self.audio
            .iter()
            .chain(self.dolby.iter())
            .filter(|track| track.id != 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn current(&self) -> TrackType {
        self.current
    }

    /// Id of the current track, 0 while it is unknown.
    pub fn current_id(&self) -> u16 {
        self.get(self.current).map(|track| track.id).unwrap_or(0)
    }

    pub fn available(&self) -> Vec<(TrackType, Track)> {
        let audio = self
            .audio
            .iter()
            .enumerate()
            .map(|(i, track)| (TrackType::Audio(i as u8), track));
        let dolby = self
            .dolby
            .iter()
            .enumerate()
            .map(|(i, track)| (TrackType::Dolby(i as u8), track));

        audio
            .chain(dolby)
            .filter(|(_, track)| track.id != 0)
            .map(|(track_type, track)| (track_type, track.clone()))
            .collect()
    }

    /// Makes a track available. Returns whether the current track has been missing for so
    /// long that another one should be selected.
    pub fn set_available(&mut self, track_type: TrackType, id: u16, language: Option<&str>) -> bool {
        if !track_type.is_valid() {
            error!(?track_type, "Invalid track");
            return false;
        }

        let current = self.current;
        let Some(track) = self.slot_mut(track_type) else {
            return false;
        };

        if let Some(language) = language {
            track.language = language.to_string();
        }
        if id == 0 {
            return false;
        }

        track.id = id;

        let count = self.len();
        if self.get(current).is_none() && count > 0 {
            self.missing_count += 1;
            if self.missing_count > count * 10 {
                return true;
            }
        } else if track_type == current {
            self.missing_count = 0;
        }

        false
    }

    pub fn set_current(&mut self, track_type: TrackType) -> bool {
        if !track_type.is_valid() {
            return false;
        }

        self.current = track_type;
        self.missing_count = 0;
        true
    }

    /// Selects the first available track if forced or if the current one is unknown.
    /// MPEG audio is preferred over Dolby Digital.
    pub fn ensure(&mut self, force: bool) -> Option<TrackType> {
        if !force && self.get(self.current).is_some() {
            return None;
        }

        let preferred = (0..MAX_AUDIO_TRACKS as u8)
            .map(TrackType::Audio)
            .chain((0..MAX_DOLBY_TRACKS as u8).map(TrackType::Dolby))
            .find(|&track_type| self.get(track_type).is_some())
            .unwrap_or(TrackType::Audio(0));

        self.set_current(preferred);
        Some(preferred)
    }
}

/// Where a PES packet goes on a decoder device.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Route {
    Video,
    Audio(u8),
    Skip,
}

/// Sorts the PES packets of a played stream into video and audio, tracking which audio
/// streams exist on the way.
#[derive(Clone, Debug)]
pub struct Dispatcher {
    pub tracks: Tracks,
    use_dolby_digital: bool,

    /// Old recordings carried nothing but AC3 in private stream 1, without substream ids.
    legacy_private_stream: bool,
}

impl Dispatcher {
    pub fn new(use_dolby_digital: bool) -> Self {
        Self {
            tracks: Tracks::new(),
            use_dolby_digital,
            legacy_private_stream: false,
        }
    }

    pub fn is_legacy(&self) -> bool {
        self.legacy_private_stream
    }

    /// Forgets the tracks of the previous stream.
    pub fn reset(&mut self) {
        self.tracks.clear();
        self.legacy_private_stream = false;
    }

    pub fn route(&mut self, packet: &[u8], video_only: bool) -> Route {
        let Some(&stream_id) = packet.get(3) else {
            return Route::Skip;
        };

        match stream_id {
            PADDING_STREAM => Route::Video,
            c if is_video_stream(c) => Route::Video,
            c if is_audio_stream(c) => {
                self.make_available(TrackType::Audio(c - 0xC0), c);

                let current = self.tracks.current_id();
                if !video_only && u16::from(c) == current {
                    Route::Audio(c)
                } else if c == 0xC0 && current == 0 {
                    // Until the tracks are known, the first MPEG audio stream is played.
                    Route::Audio(c)
                } else {
                    Route::Skip
                }
            }
            PRIVATE_STREAM_1 => {
                if self.legacy_private_stream {
                    self.route_legacy_private_stream(video_only)
                } else {
                    self.route_private_stream(packet, video_only)
                }
            }
            _ => Route::Skip,
        }
    }

    fn route_private_stream(&mut self, packet: &[u8], video_only: bool) -> Route {
        let offset = packet.get(8).map(|&len| len as usize + 9);
        let Some(&substream_id) = offset.and_then(|offset| packet.get(offset)) else {
            return Route::Skip;
        };

        let index = substream_id & 0x1F;

        match substream_id & 0xF0 {
            // Subpictures
            0x20 | 0x30 => Route::Skip,
            // AC3 and DTS
            0x80 => {
                if !self.use_dolby_digital {
                    return Route::Skip;
                }

                self.make_available(TrackType::Dolby(index), substream_id);
                self.route_current(substream_id, video_only)
            }
            // LPCM
            0xA0 => {
                self.make_available(TrackType::Audio(index), substream_id);
                self.route_current(substream_id, video_only)
            }
            _ => {
                debug!("Switching to legacy Dolby Digital compatibility mode");

                self.tracks.clear();
                self.legacy_private_stream = true;
                self.route_legacy_private_stream(video_only)
            }
        }
    }

    fn route_legacy_private_stream(&mut self, video_only: bool) -> Route {
        if !self.use_dolby_digital {
            return Route::Skip;
        }

        self.make_available(TrackType::Dolby(0), PRIVATE_STREAM_1);
        self.route_current(PRIVATE_STREAM_1, video_only)
    }

    fn route_current(&self, id: u8, video_only: bool) -> Route {
        if !video_only && u16::from(id) == self.tracks.current_id() {
            Route::Audio(id)
        } else {
            Route::Skip
        }
    }

    fn make_available(&mut self, track_type: TrackType, id: u8) {
        if self.tracks.set_available(track_type, u16::from(id), None) {
            if let Some(track) = self.tracks.ensure(false) {
                debug!(?track, "Current audio track is missing, switched");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pes(stream_id: u8, payload: &[u8]) -> Vec<u8> {
        let mut packet = vec![0x00, 0x00, 0x01, stream_id];
        packet.extend_from_slice(&((3 + payload.len()) as u16).to_be_bytes());
        packet.extend_from_slice(&[0x80, 0x00, 0x00]);
        packet.extend_from_slice(payload);
        packet
    }

    #[test]
    fn test_ensure_prefers_mpeg_audio() {
        let mut tracks = Tracks::new();
        tracks.set_available(TrackType::Dolby(0), 0x80, Some("deu"));
        tracks.set_available(TrackType::Audio(1), 0xC1, Some("eng"));

        assert_eq!(tracks.ensure(true), Some(TrackType::Audio(1)));
        assert_eq!(tracks.current_id(), 0xC1);
        assert_eq!(tracks.ensure(false), None);
        assert_eq!(tracks.len(), 2);

        tracks.clear();
        assert!(tracks.is_empty());
        assert_eq!(tracks.current_id(), 0);
    }

    #[test]
    fn test_missing_current_track_is_replaced() {
        let mut tracks = Tracks::new();
        tracks.set_current(TrackType::Audio(5));

        let mut replaced = false;
        for _ in 0..11 {
            replaced = tracks.set_available(TrackType::Audio(1), 0xC1, None);
        }

        assert!(replaced);
    }

    #[test]
    fn test_route_opportunistic_first_audio() {
        let mut dispatcher = Dispatcher::new(true);

        assert_eq!(dispatcher.route(&pes(0xE0, &[0; 4]), false), Route::Video);
        assert_eq!(dispatcher.route(&pes(0xC0, &[0; 4]), false), Route::Audio(0xC0));
        // Not the current track.
        assert_eq!(dispatcher.route(&pes(0xC1, &[0; 4]), false), Route::Skip);

        dispatcher.tracks.set_current(TrackType::Audio(1));
        assert_eq!(dispatcher.route(&pes(0xC1, &[0; 4]), false), Route::Audio(0xC1));
        assert_eq!(dispatcher.route(&pes(0xC1, &[0; 4]), true), Route::Skip);
    }

    #[test]
    fn test_route_private_streams() {
        let mut dispatcher = Dispatcher::new(true);
        dispatcher.tracks.set_current(TrackType::Dolby(0));

        assert_eq!(dispatcher.route(&pes(0xBD, &[0x80, 0x01]), false), Route::Audio(0x80));
        assert_eq!(dispatcher.route(&pes(0xBD, &[0x20, 0x01]), false), Route::Skip);
        assert_eq!(
            dispatcher.tracks.get(TrackType::Dolby(0)).map(|track| track.id),
            Some(0x80),
        );

        let mut without_dolby = Dispatcher::new(false);
        without_dolby.tracks.set_current(TrackType::Dolby(0));
        assert_eq!(without_dolby.route(&pes(0xBD, &[0x80, 0x01]), false), Route::Skip);
    }

    #[test]
    fn test_switch_to_legacy_private_stream() {
        let mut dispatcher = Dispatcher::new(true);
        dispatcher.tracks.set_current(TrackType::Dolby(0));

        // A raw AC3 sync word where the substream id would be.
        assert_eq!(
            dispatcher.route(&pes(0xBD, &[0x0B, 0x77]), false),
            Route::Audio(0xBD),
        );
        assert!(dispatcher.is_legacy());
        assert_eq!(
            dispatcher.route(&pes(0xBD, &[0x80, 0x01]), false),
            Route::Audio(0xBD),
        );

        dispatcher.reset();
        assert!(!dispatcher.is_legacy());
    }
}
