use crate::config::VIDEO_EXTENSIONS;
use crate::error::StreamError;
use crate::transfer::FileEntry;

use super::file::{extension_of, FileDescriptor};

fn is_video(entry: &FileEntry) -> bool {
    extension_of(&entry.path).is_some_and(|ext| VIDEO_EXTENSIONS.contains(&ext.as_str()))
}

/// Pick the file to stream: the largest video file, or the largest file of any kind when no
/// name looks like video. Ties go to the file listed first.
pub fn select_file(files: &[FileEntry]) -> Result<FileDescriptor, StreamError> {
    let has_video = files.iter().any(is_video);

    let mut best: Option<(usize, &FileEntry)> = None;
    for (index, entry) in files.iter().enumerate() {
        if has_video && !is_video(entry) {
            continue;
        }
        if best.map_or(true, |(_, b)| entry.length > b.length) {
            best = Some((index, entry));
        }
    }

    best.map(|(index, entry)| FileDescriptor::from_entry(index, entry))
        .ok_or(StreamError::NoPlayableFile)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn entry(path: &str, length: u64) -> FileEntry {
        FileEntry {
            path: path.to_string(),
            length,
            offset: 0,
        }
    }

    #[test]
    fn test_prefers_video_over_larger_file() {
        let files = vec![
            entry("extras.iso", 9_000),
            entry("movie.MKV", 5_000),
            entry("sample.mp4", 100),
        ];
        let selected = select_file(&files).unwrap();
        assert_eq!(selected.index, 1);
        assert_eq!(selected.path, "movie.MKV");
    }

    #[test]
    fn test_falls_back_to_largest_file() {
        let files = vec![entry("a.bin", 10), entry("payload", 30), entry("b.txt", 20)];
        assert_eq!(select_file(&files).unwrap().path, "payload");
    }

    #[test]
    fn test_ties_keep_first() {
        let files = vec![entry("one.mp4", 50), entry("two.mp4", 50)];
        assert_eq!(select_file(&files).unwrap().index, 0);
    }

    #[test]
    fn test_empty_swarm() {
        assert!(matches!(select_file(&[]), Err(StreamError::NoPlayableFile)));
    }

    fn arb_entry() -> impl Strategy<Value = FileEntry> {
        (
            prop::sample::select(vec!["mp4", "mkv", "TS", "txt", "nfo", "srt", ""]),
            0u64..1_000,
        )
            .prop_map(|(ext, length)| {
                let path = if ext.is_empty() {
                    "file".to_string()
                } else {
                    format!("file.{}", ext)
                };
                entry(&path, length)
            })
    }

    proptest! {
        #[test]
        fn prop_selects_first_largest_candidate(files in prop::collection::vec(arb_entry(), 0..12)) {
            let candidates: Vec<usize> = if files.iter().any(is_video) {
                (0..files.len()).filter(|&i| is_video(&files[i])).collect()
            } else {
                (0..files.len()).collect()
            };

            match select_file(&files) {
                Ok(selected) => {
                    let max = candidates.iter().map(|&i| files[i].length).max().unwrap();
                    let first = candidates.iter().copied().find(|&i| files[i].length == max).unwrap();
                    prop_assert_eq!(selected.index, first);
                }
                Err(_) => prop_assert!(files.is_empty()),
            }
        }
    }
}
