use std::path::Path;

use emberdb::{Category, Config, Db};
use tempfile::TempDir;

fn small_config(path: &Path) -> Config {
    let mut cfg = Config::new(path);
    cfg.max_log_file_size = 150;
    cfg.discard_buffer_size = 8192;
    cfg
}

fn count_logs(dir: &Path, tag: &str) -> usize {
    let prefix = format!("log.{tag}.");
    std::fs::read_dir(dir)
        .expect("read dir")
        .filter_map(|e| e.ok())
        .filter_map(|e| e.file_name().into_string().ok())
        .filter(|name| name.starts_with(&prefix))
        .count()
}

#[test]
fn merging_overwrites_reclaims_files_and_keeps_last_value() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    {
        let db = Db::open(small_config(dir.path()))?;
        for n in 0..100u32 {
            db.set(b"hot-key", format!("value-{n:03}").as_bytes())?;
        }
        // close drains the discard channel so the counters are durable
        db.close()?;
    }
    let before = count_logs(dir.path(), "strs");
    assert!(before > 10, "expected many files, got {before}");

    let db = Db::open(small_config(dir.path()))?;
    db.merge(Category::Str, 0.1)?;

    let after = count_logs(dir.path(), "strs");
    assert!(after < before, "merge should remove files: {before} -> {after}");
    assert_eq!(db.get(b"hot-key")?.as_ref(), b"value-099");

    // merged state must also survive another recovery
    db.close()?;
    let db = Db::open(small_config(dir.path()))?;
    assert_eq!(db.get(b"hot-key")?.as_ref(), b"value-099");
    Ok(())
}

#[test]
fn merge_preserves_live_keys_from_merged_files() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    {
        let db = Db::open(small_config(dir.path()))?;
        // interleave keys that stay live with churn on one hot key, so
        // candidate files still contain live entries to rewrite
        for n in 0..40u32 {
            db.set(format!("live-{n:02}").as_bytes(), format!("v{n:02}").as_bytes())?;
            db.set(b"churn", format!("c{n:02}").as_bytes())?;
        }
        db.close()?;
    }

    let db = Db::open(small_config(dir.path()))?;
    let before = count_logs(dir.path(), "strs");
    db.merge(Category::Str, 0.3)?;
    assert!(count_logs(dir.path(), "strs") < before);

    for n in 0..40u32 {
        let value = db.get(format!("live-{n:02}").as_bytes())?;
        assert_eq!(value.as_ref(), format!("v{n:02}").as_bytes());
    }
    assert_eq!(db.get(b"churn")?.as_ref(), b"c39");

    // and again after recovery
    db.close()?;
    let db = Db::open(small_config(dir.path()))?;
    for n in 0..40u32 {
        let value = db.get(format!("live-{n:02}").as_bytes())?;
        assert_eq!(value.as_ref(), format!("v{n:02}").as_bytes());
    }
    Ok(())
}

#[test]
fn merge_reclaims_deleted_hash_fields() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    {
        let db = Db::open(small_config(dir.path()))?;
        for n in 0..60u32 {
            db.hset(b"h", &[(format!("f{n:02}").as_bytes(), &b"x"[..])])?;
        }
        for n in 0..50u32 {
            db.hdel(b"h", &[format!("f{n:02}").as_bytes()])?;
        }
        db.close()?;
    }

    let db = Db::open(small_config(dir.path()))?;
    assert_eq!(db.hlen(b"h"), 10);
    let before = count_logs(dir.path(), "hash");
    db.merge(Category::Hash, 0.3)?;
    assert!(count_logs(dir.path(), "hash") < before);

    for n in 50..60u32 {
        let value = db.hget(b"h", format!("f{n:02}").as_bytes())?;
        assert_eq!(value.as_deref(), Some(&b"x"[..]), "f{n:02} must survive");
    }
    assert_eq!(db.hlen(b"h"), 10);
    Ok(())
}

#[test]
fn merge_below_threshold_is_a_noop() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    {
        let db = Db::open(small_config(dir.path()))?;
        // distinct keys only: nothing is ever invalidated
        for n in 0..20u32 {
            db.set(format!("key-{n:02}").as_bytes(), &[b'v'; 32])?;
        }
        db.close()?;
    }
    let db = Db::open(small_config(dir.path()))?;
    let before = count_logs(dir.path(), "strs");
    db.merge(Category::Str, 0.5)?;
    assert_eq!(count_logs(dir.path(), "strs"), before);
    for n in 0..20u32 {
        assert_eq!(db.get(format!("key-{n:02}").as_bytes())?.as_ref(), &[b'v'; 32]);
    }
    Ok(())
}

#[test]
fn merge_reclaims_zset_churn() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    {
        let db = Db::open(small_config(dir.path()))?;
        for n in 0..50u32 {
            db.zadd(b"z", &[(n as f64, &b"member"[..])])?;
            db.zadd(b"z", &[(n as f64, format!("keep-{n:02}").as_bytes())])?;
        }
        db.close()?;
    }

    let db = Db::open(small_config(dir.path()))?;
    let before = count_logs(dir.path(), "zset");
    db.merge(Category::ZSet, 0.3)?;
    assert!(count_logs(dir.path(), "zset") < before);

    assert_eq!(db.zscore(b"z", b"member")?, Some(49.0));
    assert_eq!(db.zcard(b"z"), 51);
    for n in 0..50u32 {
        assert_eq!(
            db.zscore(b"z", format!("keep-{n:02}").as_bytes())?,
            Some(n as f64)
        );
    }
    Ok(())
}
