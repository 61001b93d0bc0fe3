use std::{
    fs::{self, OpenOptions},
    io,
    path::{Component, Path, PathBuf},
};

use crate::format::FileFormat;

pub const DEFAULT_MAX_PATH_LEN: usize = 4096;
pub const MAX_COMPONENT_BYTES: usize = 255;

const FORBIDDEN_CHARACTERS: &[char] = &['<', '>', ':', '"', '|', '?', '*'];
const RESERVED_DEVICE_NAMES: &[&str] = &["CON", "PRN", "AUX", "NUL"];

fn is_reserved_device_name(stem: &str) -> bool {
    let upper = stem.to_ascii_uppercase();
    if RESERVED_DEVICE_NAMES.contains(&upper.as_str()) {
        return true;
    }
    ["COM", "LPT"].iter().any(|prefix| {
        upper
            .strip_prefix(prefix)
            .is_some_and(|digit| digit.len() == 1 && matches!(digit.as_bytes()[0], b'1'..=b'9'))
    })
}

fn is_valid_component(component: &str) -> bool {
    !component.is_empty()
        && !component
            .chars()
            .any(|character| character.is_control() || FORBIDDEN_CHARACTERS.contains(&character))
}

/// Whether `path` names a file that could be created on any supported platform.
#[must_use]
pub fn is_valid_filename(path: &Path, max_path_len: usize) -> bool {
    let Some(raw) = path.to_str() else {
        return false;
    };
    if raw.is_empty() || raw.len() > max_path_len || raw.ends_with(['/', '\\']) {
        return false;
    }

    let mut normal_components = 0_usize;
    for component in path.components() {
        if let Component::Normal(part) = component {
            let Some(part) = part.to_str() else {
                return false;
            };
            if !is_valid_component(part) {
                return false;
            }
            normal_components += 1;
        }
    }
    if normal_components == 0 {
        return false;
    }

    let Some(file_name) = path.file_name().and_then(|name| name.to_str()) else {
        return false;
    };
    if file_name.len() > MAX_COMPONENT_BYTES || file_name.ends_with(['.', ' ']) {
        return false;
    }
    let stem = file_name.split('.').next().unwrap_or(file_name);
    !is_reserved_device_name(stem.trim_end())
}

fn denies_writes(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::PermissionDenied | io::ErrorKind::ReadOnlyFilesystem
    )
}

/// True if the file exists and cannot be opened for writing.
#[must_use]
pub fn is_file_read_only(path: &Path) -> bool {
    match fs::metadata(path) {
        Ok(metadata) if metadata.is_file() => {
            metadata.permissions().readonly()
                || OpenOptions::new()
                    .write(true)
                    .open(path)
                    .is_err_and(|error| denies_writes(&error))
        }
        _ => false,
    }
}

/// True if the file's folder, or its nearest existing ancestor when the folder
/// does not exist yet, cannot be written to.
#[must_use]
pub fn is_folder_read_only(path: &Path) -> bool {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    for ancestor in parent.ancestors() {
        if ancestor.as_os_str().is_empty() {
            continue;
        }
        if let Ok(metadata) = fs::metadata(ancestor) {
            if !metadata.is_dir() || metadata.permissions().readonly() {
                return true;
            }
            // Creating an entry is the only check that sees ownership, ACLs and read-only mounts.
            return tempfile::Builder::new()
                .prefix(".wavelane-write-check")
                .tempfile_in(ancestor)
                .is_err_and(|error| denies_writes(&error));
        }
    }
    false
}

/// Gives `path` the format's primary extension unless it already carries an
/// acceptable one. Another format's extension is replaced; anything after a
/// dot that names no format is kept as part of the name.
#[must_use]
pub fn with_format_extension(path: &Path, format: FileFormat) -> PathBuf {
    if format.accepts_extension(path) {
        return path.to_path_buf();
    }
    if FileFormat::from_path(path).is_some() {
        return path.with_extension(format.primary_extension());
    }
    let mut appended = path.as_os_str().to_owned();
    appended.push(".");
    appended.push(format.primary_extension());
    PathBuf::from(appended)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid(path: &str) -> bool {
        is_valid_filename(Path::new(path), DEFAULT_MAX_PATH_LEN)
    }

    #[test]
    fn ordinary_paths_are_valid() {
        assert!(valid("/tmp/song.wlsx"));
        assert!(valid("relative/dir/take 1.wav"));
        assert!(valid("/tmp/console.wav"));
        assert!(valid("/tmp/COM10.wav"));
    }

    #[test]
    fn malformed_names_are_rejected() {
        assert!(!valid(""));
        assert!(!valid("/tmp/"));
        assert!(!valid("/tmp/a?b.wav"));
        assert!(!valid("/tmp/a\u{7}b.wav"));
        assert!(!valid("/tmp/in<valid>/a.wav"));
        assert!(!valid("/tmp/trailing."));
        assert!(!valid("/tmp/trailing "));
        assert!(!valid("/tmp/CON"));
        assert!(!valid("/tmp/nul.wav"));
        assert!(!valid("/tmp/lpt3.wlsx"));
        assert!(!valid(&format!("/tmp/{}.wav", "a".repeat(300))));
        assert!(!is_valid_filename(Path::new("/tmp/abc.wav"), 8));
    }

    #[test]
    fn read_only_checks_follow_permission_bits() {
        let temp = tempfile::tempdir().expect("temp dir");
        let file = temp.path().join("a.wav");
        fs::write(&file, b"x").expect("write");
        assert!(!is_file_read_only(&file));
        assert!(!is_folder_read_only(&file));

        let mut permissions = fs::metadata(&file).expect("metadata").permissions();
        permissions.set_readonly(true);
        fs::set_permissions(&file, permissions).expect("set permissions");
        assert!(is_file_read_only(&file));

        let locked = temp.path().join("locked");
        fs::create_dir(&locked).expect("create dir");
        let mut permissions = fs::metadata(&locked).expect("metadata").permissions();
        permissions.set_readonly(true);
        fs::set_permissions(&locked, permissions.clone()).expect("set permissions");
        assert!(is_folder_read_only(&locked.join("a.wav")));
        assert!(is_folder_read_only(&locked.join("missing/deeper/a.wav")));
        assert!(!is_folder_read_only(&temp.path().join("missing/a.wav")));

        permissions.set_readonly(false);
        fs::set_permissions(&locked, permissions).expect("restore permissions");
    }

    #[cfg(unix)]
    #[test]
    fn folders_writable_by_mode_alone_are_still_checked() {
        use std::os::unix::fs::PermissionsExt;

        let temp = tempfile::tempdir().expect("temp dir");
        let unsearchable = temp.path().join("unsearchable");
        fs::create_dir(&unsearchable).expect("create dir");
        fs::set_permissions(&unsearchable, fs::Permissions::from_mode(0o600))
            .expect("drop search permission");
        assert!(!fs::metadata(&unsearchable)
            .expect("metadata")
            .permissions()
            .readonly());

        // Privileged users bypass the mode entirely, so the folder is writable for them.
        let writable = fs::write(unsearchable.join("canary"), b"x").is_ok();
        assert_eq!(
            is_folder_read_only(&unsearchable.join("a.wav")),
            !writable
        );
        assert!(fs::read_dir(&unsearchable).is_ok_and(|entries| entries
            .filter_map(Result::ok)
            .all(|entry| !entry.file_name().to_string_lossy().starts_with(".wavelane"))));

        fs::set_permissions(&unsearchable, fs::Permissions::from_mode(0o755))
            .expect("restore permissions");
    }

    #[test]
    fn export_extension_is_rewritten() {
        assert_eq!(
            with_format_extension(Path::new("/tmp/mix.mp3"), FileFormat::WavePcm),
            PathBuf::from("/tmp/mix.wav")
        );
        assert_eq!(
            with_format_extension(Path::new("/tmp/mix.AIF"), FileFormat::Aiff),
            PathBuf::from("/tmp/mix.AIF")
        );
        assert_eq!(
            with_format_extension(Path::new("/tmp/mix"), FileFormat::Flac),
            PathBuf::from("/tmp/mix.flac")
        );
        assert_eq!(
            with_format_extension(Path::new("/tmp/Mix.v2"), FileFormat::Session),
            PathBuf::from("/tmp/Mix.v2.wlsx")
        );
        assert_eq!(
            with_format_extension(Path::new("/tmp/take 1.final"), FileFormat::WavePcm),
            PathBuf::from("/tmp/take 1.final.wav")
        );
    }
}
