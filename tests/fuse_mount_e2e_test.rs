// FUSE mount E2E tests - requires FUSE permissions and /dev/fuse
// Run with: cargo test --test fuse_mount_e2e_test -- --ignored

use anyhow::Result;
use mirrorfs::config::MirrorConfig;
use mirrorfs::fuse::{MountOptions, spawn};
use mirrorfs::oracle::{MirrorFs, Recorder};
use std::fs;
use std::io::{Read, Write};
use std::sync::Arc;
use std::thread::sleep;
use std::time::Duration;
use tempfile::TempDir;

struct Mounted {
    primary: TempDir,
    mirror: TempDir,
    mountpoint: TempDir,
    recorder: Arc<Recorder>,
    session: Option<fuser::BackgroundSession>,
}

fn mount_pair() -> Result<Mounted> {
    let primary = tempfile::tempdir()?;
    let mirror = tempfile::tempdir()?;
    let mountpoint = tempfile::tempdir()?;
    let recorder = Arc::new(Recorder::new());

    let fs = MirrorFs::open_roots(
        primary.path(),
        mirror.path(),
        recorder.clone(),
        &MirrorConfig::default(),
    )?;
    let session = spawn(Arc::new(fs), mountpoint.path(), &MountOptions::default())?;

    // Give the kernel a moment to complete the mount handshake.
    sleep(Duration::from_millis(200));

    Ok(Mounted { primary, mirror, mountpoint, recorder, session: Some(session) })
}

impl Drop for Mounted {
    fn drop(&mut self) {
        drop(self.session.take());
    }
}

#[test]
#[ignore] // Requires FUSE permissions
fn test_mounted_writes_reach_both_trees() -> Result<()> {
    let m = mount_pair()?;
    let root = m.mountpoint.path();

    fs::create_dir(root.join("docs"))?;
    let mut file = fs::File::create(root.join("docs/note.txt"))?;
    file.write_all(b"Hello, mirrorfs!")?;
    drop(file);

    let mut content = String::new();
    fs::File::open(root.join("docs/note.txt"))?.read_to_string(&mut content)?;
    assert_eq!(content, "Hello, mirrorfs!");

    assert_eq!(fs::read(m.primary.path().join("docs/note.txt"))?, b"Hello, mirrorfs!");
    assert_eq!(fs::read(m.mirror.path().join("docs/note.txt"))?, b"Hello, mirrorfs!");

    let names: Vec<_> = fs::read_dir(root.join("docs"))?
        .map(|e| e.map(|e| e.file_name().to_string_lossy().into_owned()))
        .collect::<std::io::Result<_>>()?;
    assert_eq!(names, vec!["note.txt".to_string()]);

    fs::rename(root.join("docs/note.txt"), root.join("docs/renamed.txt"))?;
    fs::remove_file(root.join("docs/renamed.txt"))?;
    fs::remove_dir(root.join("docs"))?;

    assert!(m.recorder.is_empty(), "divergences: {:?}", m.recorder.records());
    Ok(())
}

#[test]
#[ignore] // Requires FUSE permissions
fn test_mounted_out_of_band_change_is_recorded() -> Result<()> {
    let m = mount_pair()?;
    fs::write(m.primary.path().join("f"), b"hello")?;
    fs::write(m.mirror.path().join("f"), b"hell")?;

    let meta = fs::metadata(m.mountpoint.path().join("f"))?;
    assert_eq!(meta.len(), 5);

    let records = m.recorder.records();
    assert!(records.iter().any(|r| r.detail.contains("size: 5 != 4")));
    Ok(())
}
