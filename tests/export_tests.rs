use seqengine::transport::LoopbackTransport;
use seqengine::*;
use std::fs;
use std::sync::Arc;

struct Chords {
    tracks: Vec<TrackRef>,
}

impl PlaybackFeed for Chords {
    fn process(&mut self, sink: &mut dyn EventSink, start: u64, end: u64) {
        // A note per track on every beat (24000 frames at 120 BPM).
        let first = start.div_ceil(24_000) * 24_000;
        for time in (first..end).step_by(24_000) {
            for (index, track) in self.tracks.iter().enumerate() {
                let note = 60 + index as u8;
                sink.enqueue(track, Event::note_on(0, note, 100, time), time, 1.0);
                sink.enqueue(track, Event::note_off(0, note, time + 12_000), time + 12_000, 1.0);
            }
        }
    }
}

fn chunk_count(data: &[u8], id: &[u8; 4]) -> usize {
    data.windows(4).filter(|window| window == id).count()
}

fn export_engine() -> (Engine, BusId, BusId) {
    let mut engine =
        Engine::new(Arc::new(LoopbackTransport::new()), EngineSettings::default()).unwrap();
    let a = engine.add_bus("Piano", BusMode::Output, false).unwrap();
    let b = engine.add_bus("Bass", BusMode::Output, false).unwrap();
    engine.set_feed(Box::new(Chords {
        tracks: vec![
            TrackRef::new(TrackId(1), a, 0),
            TrackRef::new(TrackId(2), a, 1),
            TrackRef::new(TrackId(3), b, 2),
        ],
    }));
    (engine, a, b)
}

#[test]
fn test_export_writes_format_one_file() {
    let (engine, _a, _b) = export_engine();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("song.mid");

    // One bar: four beats, three tracks, note-on plus note-off each.
    let count = engine.file_export(&path, 0, 96_000, None).unwrap();
    assert_eq!(count, 24);

    let data = fs::read(&path).unwrap();
    assert_eq!(&data[..4], b"MThd");
    assert_eq!(&data[4..8], &[0, 0, 0, 6]);
    // Format 1, tempo track plus one track per bus, 960 ticks per beat.
    assert_eq!(&data[8..14], &[0, 1, 0, 3, 0x03, 0xC0]);
    assert_eq!(chunk_count(&data, b"MTrk"), 3);
}

#[test]
fn test_export_single_bus_skips_muted_tracks() {
    let (engine, a, _b) = export_engine();
    engine.track_mute(TrackId(2), true);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("piano.mid");

    let count = engine.file_export(&path, 0, 96_000, Some(a)).unwrap();
    assert_eq!(count, 8);
    let data = fs::read(&path).unwrap();
    assert_eq!(chunk_count(&data, b"MTrk"), 2);
}

#[test]
fn test_export_requires_feed_and_range() {
    let (engine, _a, _b) = export_engine();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("none.mid");

    assert!(engine.file_export(&path, 100, 100, None).is_err());
    engine.take_feed();
    assert!(matches!(
        engine.file_export(&path, 0, 96_000, None),
        Err(MidiError::ConfigurationError(_))
    ));
    assert!(!path.exists());
}
