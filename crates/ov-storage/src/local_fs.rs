//! Local-disk AGFS backend.
//!
//! Maps `viking://scope/path` onto `<root>/scope/path`. Files hold the
//! exact user bytes; writes go through a hidden temp file plus rename so
//! readers never observe partial content.

use crate::agfs::{
    Agfs, Entry, LsOptions, StatInfo, TreeNode, TreeOptions, WriteOptions, ABSTRACT_FILE,
    MOVING_MARKER,
};
use async_recursion::async_recursion;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ov_core::error::{OvError, Result};
use ov_core::uri::VikingUri;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// AGFS over a local directory root.
pub struct LocalAgfs {
    root: PathBuf,
}

impl LocalAgfs {
    /// Open (and create) a local AGFS rooted at the given directory.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .await
            .map_err(|e| OvError::dependency(format!("create agfs root {}: {e}", root.display())))?;
        Ok(Self { root })
    }

    /// Convert a URI to its on-disk path.
    pub fn uri_to_path(&self, uri: &VikingUri) -> PathBuf {
        if uri.is_root() {
            self.root.clone()
        } else {
            self.root.join(uri.path())
        }
    }

    /// Convert an on-disk path back to a URI.
    pub fn path_to_uri(&self, path: &Path) -> Result<VikingUri> {
        let rel = path
            .strip_prefix(&self.root)
            .map_err(|_| OvError::InvariantViolation(format!("path escapes root: {}", path.display())))?;
        let rel_str = rel.to_string_lossy().replace('\\', "/");
        VikingUri::root().join_path(&rel_str)
    }

    fn io_err(uri: &VikingUri, op: &str, e: std::io::Error) -> OvError {
        match e.kind() {
            std::io::ErrorKind::NotFound => OvError::not_found(uri.as_str()),
            std::io::ErrorKind::AlreadyExists => OvError::AlreadyExists(uri.as_str().to_string()),
            _ => OvError::dependency(format!("{op} {uri}: {e}")),
        }
    }

    async fn entry_for(&self, uri: VikingUri, path: &Path) -> Entry {
        let meta = fs::metadata(path).await.ok();
        let is_dir = meta.as_ref().map(|m| m.is_dir()).unwrap_or(false);
        let size = meta.as_ref().map(|m| m.len()).unwrap_or(0);
        let mtime = meta.and_then(|m| m.modified().ok()).map(DateTime::<Utc>::from);
        let abstract_text = if is_dir {
            fs::read_to_string(path.join(ABSTRACT_FILE)).await.ok()
        } else {
            None
        };
        Entry { uri, is_dir, size, mtime, abstract_text }
    }

    async fn sorted_child_names(&self, path: &Path, uri: &VikingUri) -> Result<Vec<String>> {
        let mut rd = fs::read_dir(path)
            .await
            .map_err(|e| Self::io_err(uri, "ls", e))?;
        let mut names = Vec::new();
        while let Some(entry) = rd
            .next_entry()
            .await
            .map_err(|e| OvError::dependency(format!("ls entry under {uri}: {e}")))?
        {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        names.sort();
        Ok(names)
    }

    #[async_recursion]
    async fn walk(
        &self,
        uri: &VikingUri,
        opts: LsOptions,
        out: &mut Vec<Entry>,
    ) -> Result<()> {
        let path = self.uri_to_path(uri);
        for name in self.sorted_child_names(&path, uri).await? {
            if let Some(limit) = opts.node_limit {
                if out.len() >= limit {
                    return Ok(());
                }
            }
            if !opts.include_hidden && name.starts_with('.') {
                continue;
            }
            let child_uri = uri.join(&name)?;
            let child_path = path.join(&name);
            let entry = self.entry_for(child_uri.clone(), &child_path).await;
            let is_dir = entry.is_dir;
            out.push(entry);
            if opts.recursive && is_dir {
                self.walk(&child_uri, opts, out).await?;
            }
        }
        Ok(())
    }

    #[async_recursion]
    async fn build_tree(
        &self,
        uri: &VikingUri,
        opts: TreeOptions,
        depth: usize,
        remaining: &mut usize,
    ) -> Result<TreeNode> {
        let path = self.uri_to_path(uri);
        let entry = self.entry_for(uri.clone(), &path).await;
        let mut node = TreeNode { entry, children: Vec::new() };
        if !node.entry.is_dir {
            return Ok(node);
        }
        if let Some(max) = opts.depth {
            if depth >= max {
                return Ok(node);
            }
        }
        for name in self.sorted_child_names(&path, uri).await? {
            if name.starts_with('.') {
                continue;
            }
            if *remaining == 0 {
                break;
            }
            *remaining -= 1;
            let child_uri = uri.join(&name)?;
            node.children
                .push(self.build_tree(&child_uri, opts, depth + 1, remaining).await?);
        }
        Ok(node)
    }

    #[async_recursion]
    async fn copy_dir(&self, src: &Path, dst: &Path) -> Result<()> {
        fs::create_dir_all(dst)
            .await
            .map_err(|e| OvError::dependency(format!("copy mkdir {}: {e}", dst.display())))?;
        let mut rd = fs::read_dir(src)
            .await
            .map_err(|e| OvError::dependency(format!("copy ls {}: {e}", src.display())))?;
        while let Some(entry) = rd
            .next_entry()
            .await
            .map_err(|e| OvError::dependency(format!("copy entry: {e}")))?
        {
            let from = entry.path();
            let to = dst.join(entry.file_name());
            let meta = entry
                .metadata()
                .await
                .map_err(|e| OvError::dependency(format!("copy stat: {e}")))?;
            if meta.is_dir() {
                self.copy_dir(&from, &to).await?;
            } else {
                fs::copy(&from, &to)
                    .await
                    .map_err(|e| OvError::dependency(format!("copy {}: {e}", from.display())))?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Agfs for LocalAgfs {
    async fn read(&self, uri: &VikingUri) -> Result<Vec<u8>> {
        let path = self.uri_to_path(uri);
        if fs::metadata(&path).await.map(|m| m.is_dir()).unwrap_or(false) {
            return Err(OvError::invalid(format!("is a directory: {uri}")));
        }
        fs::read(&path).await.map_err(|e| Self::io_err(uri, "read", e))
    }

    async fn write(&self, uri: &VikingUri, data: &[u8], opts: WriteOptions) -> Result<()> {
        let path = self.uri_to_path(uri);
        let parent_uri = uri
            .parent()
            .ok_or_else(|| OvError::invalid("cannot write the namespace root"))?;
        let parent = self.uri_to_path(&parent_uri);
        if !fs::metadata(&parent).await.map(|m| m.is_dir()).unwrap_or(false) {
            return Err(OvError::not_found(format!("parent of {uri}: {parent_uri}")));
        }
        if opts.create_only && fs::try_exists(&path).await.unwrap_or(false) {
            return Err(OvError::AlreadyExists(uri.as_str().to_string()));
        }
        // Write-then-rename keeps readers on whole content.
        let tmp_name = format!(".tmp-{}", uuid::Uuid::new_v4().simple());
        let tmp = parent.join(tmp_name);
        let mut file = fs::File::create(&tmp)
            .await
            .map_err(|e| Self::io_err(uri, "write", e))?;
        file.write_all(data)
            .await
            .map_err(|e| Self::io_err(uri, "write", e))?;
        file.flush().await.map_err(|e| Self::io_err(uri, "write", e))?;
        drop(file);
        fs::rename(&tmp, &path)
            .await
            .map_err(|e| Self::io_err(uri, "write rename", e))
    }

    async fn append(&self, uri: &VikingUri, data: &[u8]) -> Result<()> {
        let path = self.uri_to_path(uri);
        let parent_uri = uri
            .parent()
            .ok_or_else(|| OvError::invalid("cannot append to the namespace root"))?;
        let parent = self.uri_to_path(&parent_uri);
        if !fs::metadata(&parent).await.map(|m| m.is_dir()).unwrap_or(false) {
            return Err(OvError::not_found(format!("parent of {uri}: {parent_uri}")));
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| Self::io_err(uri, "append", e))?;
        file.write_all(data)
            .await
            .map_err(|e| Self::io_err(uri, "append", e))
    }

    async fn mkdir(&self, uri: &VikingUri) -> Result<()> {
        let path = self.uri_to_path(uri);
        fs::create_dir_all(&path)
            .await
            .map_err(|e| Self::io_err(uri, "mkdir", e))
    }

    async fn ls(&self, uri: &VikingUri, opts: LsOptions) -> Result<Vec<Entry>> {
        let path = self.uri_to_path(uri);
        let meta = fs::metadata(&path)
            .await
            .map_err(|e| Self::io_err(uri, "ls", e))?;
        if !meta.is_dir() {
            return Err(OvError::invalid(format!("not a directory: {uri}")));
        }
        let mut out = Vec::new();
        self.walk(uri, opts, &mut out).await?;
        out.sort_by(|a, b| a.uri.cmp(&b.uri));
        if let Some(limit) = opts.node_limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    async fn stat(&self, uri: &VikingUri) -> Result<StatInfo> {
        let path = self.uri_to_path(uri);
        match fs::metadata(&path).await {
            Ok(meta) => Ok(StatInfo {
                exists: true,
                is_dir: meta.is_dir(),
                size: meta.len(),
                mtime: meta.modified().ok().map(DateTime::<Utc>::from),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(StatInfo::missing()),
            Err(e) => Err(OvError::dependency(format!("stat {uri}: {e}"))),
        }
    }

    async fn tree(&self, uri: &VikingUri, opts: TreeOptions) -> Result<TreeNode> {
        let stat = self.stat(uri).await?;
        if !stat.exists {
            return Err(OvError::not_found(uri.as_str()));
        }
        let mut remaining = opts.node_limit.unwrap_or(usize::MAX);
        self.build_tree(uri, opts, 0, &mut remaining).await
    }

    async fn delete(&self, uri: &VikingUri, recursive: bool) -> Result<()> {
        let path = self.uri_to_path(uri);
        let meta = fs::metadata(&path)
            .await
            .map_err(|e| Self::io_err(uri, "delete", e))?;
        if meta.is_dir() {
            if recursive {
                fs::remove_dir_all(&path)
                    .await
                    .map_err(|e| Self::io_err(uri, "delete", e))
            } else {
                if !self.sorted_child_names(&path, uri).await?.is_empty() {
                    return Err(OvError::invalid(format!("directory not empty: {uri}")));
                }
                fs::remove_dir(&path)
                    .await
                    .map_err(|e| Self::io_err(uri, "delete", e))
            }
        } else {
            fs::remove_file(&path)
                .await
                .map_err(|e| Self::io_err(uri, "delete", e))
        }
    }

    async fn mv(&self, src: &VikingUri, dst: &VikingUri) -> Result<()> {
        let src_path = self.uri_to_path(src);
        let dst_path = self.uri_to_path(dst);
        let src_meta = fs::metadata(&src_path)
            .await
            .map_err(|e| Self::io_err(src, "mv", e))?;
        if fs::try_exists(&dst_path).await.unwrap_or(false) {
            return Err(OvError::AlreadyExists(dst.as_str().to_string()));
        }
        if let Some(parent) = dst_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| OvError::dependency(format!("mv mkdir {}: {e}", parent.display())))?;
        }
        if src_meta.is_dir() {
            // Copy-then-delete; while the marker exists the destination
            // is incomplete.
            tracing::debug!(src = %src, dst = %dst, "directory move via copy");
            fs::create_dir_all(&dst_path)
                .await
                .map_err(|e| Self::io_err(dst, "mv mkdir", e))?;
            let marker = dst_path.join(MOVING_MARKER);
            fs::write(&marker, b"")
                .await
                .map_err(|e| Self::io_err(dst, "mv marker", e))?;
            self.copy_dir(&src_path, &dst_path).await?;
            fs::remove_file(&marker)
                .await
                .map_err(|e| Self::io_err(dst, "mv marker", e))?;
            fs::remove_dir_all(&src_path)
                .await
                .map_err(|e| Self::io_err(src, "mv cleanup", e))
        } else {
            fs::rename(&src_path, &dst_path)
                .await
                .map_err(|e| Self::io_err(src, "mv", e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn make_fs() -> (TempDir, LocalAgfs) {
        let tmp = TempDir::new().unwrap();
        let agfs = LocalAgfs::open(tmp.path().join("agfs")).await.unwrap();
        (tmp, agfs)
    }

    fn uri(s: &str) -> VikingUri {
        VikingUri::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_write_read_roundtrip() {
        let (_tmp, agfs) = make_fs().await;
        agfs.mkdir(&uri("viking://resources")).await.unwrap();
        agfs.write(&uri("viking://resources/a.txt"), b"hello", WriteOptions::default())
            .await
            .unwrap();
        let data = agfs.read(&uri("viking://resources/a.txt")).await.unwrap();
        assert_eq!(data, b"hello");
    }

    #[tokio::test]
    async fn test_write_requires_parent() {
        let (_tmp, agfs) = make_fs().await;
        let err = agfs
            .write(&uri("viking://resources/missing/a.txt"), b"x", WriteOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_write_create_only() {
        let (_tmp, agfs) = make_fs().await;
        agfs.mkdir(&uri("viking://resources")).await.unwrap();
        let u = uri("viking://resources/once.txt");
        let opts = WriteOptions { create_only: true };
        agfs.write(&u, b"first", opts).await.unwrap();
        let err = agfs.write(&u, b"second", opts).await.unwrap_err();
        assert_eq!(err.code(), "ALREADY_EXISTS");
        assert_eq!(agfs.read(&u).await.unwrap(), b"first");
    }

    #[tokio::test]
    async fn test_overwrite_replaces_content() {
        let (_tmp, agfs) = make_fs().await;
        agfs.mkdir(&uri("viking://resources")).await.unwrap();
        let u = uri("viking://resources/ow.txt");
        agfs.write(&u, b"one", WriteOptions::default()).await.unwrap();
        agfs.write(&u, b"two", WriteOptions::default()).await.unwrap();
        assert_eq!(agfs.read(&u).await.unwrap(), b"two");
    }

    #[tokio::test]
    async fn test_read_missing_is_not_found() {
        let (_tmp, agfs) = make_fs().await;
        let err = agfs.read(&uri("viking://resources/nope")).await.unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_read_dir_rejected() {
        let (_tmp, agfs) = make_fs().await;
        agfs.mkdir(&uri("viking://resources/d")).await.unwrap();
        let err = agfs.read(&uri("viking://resources/d")).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_ARGUMENT");
    }

    #[tokio::test]
    async fn test_binary_exact_bytes() {
        let (_tmp, agfs) = make_fs().await;
        agfs.mkdir(&uri("viking://resources")).await.unwrap();
        let data = vec![0u8, 1, 2, 255, 254, 0, 7];
        let u = uri("viking://resources/bin.dat");
        agfs.write(&u, &data, WriteOptions::default()).await.unwrap();
        assert_eq!(agfs.read(&u).await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_ls_sorted_and_hides_dotfiles() {
        let (_tmp, agfs) = make_fs().await;
        agfs.mkdir(&uri("viking://resources/d")).await.unwrap();
        for name in ["b.md", "a.md", ".abstract.md", "c.md"] {
            agfs.write(
                &uri(&format!("viking://resources/d/{name}")),
                b"x",
                WriteOptions::default(),
            )
            .await
            .unwrap();
        }
        let entries = agfs.ls(&uri("viking://resources/d"), LsOptions::default()).await.unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.uri.name().unwrap().to_string()).collect();
        assert_eq!(names, vec!["a.md", "b.md", "c.md"]);
    }

    #[tokio::test]
    async fn test_ls_include_hidden() {
        let (_tmp, agfs) = make_fs().await;
        agfs.mkdir(&uri("viking://resources/d")).await.unwrap();
        agfs.write(&uri("viking://resources/d/.abstract.md"), b"A", WriteOptions::default())
            .await
            .unwrap();
        let opts = LsOptions { include_hidden: true, ..Default::default() };
        let entries = agfs.ls(&uri("viking://resources/d"), opts).await.unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn test_ls_populates_abstract() {
        let (_tmp, agfs) = make_fs().await;
        agfs.mkdir(&uri("viking://resources/d/sub")).await.unwrap();
        agfs.write(
            &uri("viking://resources/d/sub/.abstract.md"),
            b"Sub purpose.",
            WriteOptions::default(),
        )
        .await
        .unwrap();
        let entries = agfs.ls(&uri("viking://resources/d"), LsOptions::default()).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].abstract_text.as_deref(), Some("Sub purpose."));
    }

    #[tokio::test]
    async fn test_ls_recursive_with_limit() {
        let (_tmp, agfs) = make_fs().await;
        agfs.mkdir(&uri("viking://resources/d/s1")).await.unwrap();
        agfs.mkdir(&uri("viking://resources/d/s2")).await.unwrap();
        for i in 0..5 {
            agfs.write(
                &uri(&format!("viking://resources/d/s1/f{i}.md")),
                b"x",
                WriteOptions::default(),
            )
            .await
            .unwrap();
        }
        let opts = LsOptions { recursive: true, node_limit: Some(3), ..Default::default() };
        let entries = agfs.ls(&uri("viking://resources/d"), opts).await.unwrap();
        assert_eq!(entries.len(), 3);
    }

    #[tokio::test]
    async fn test_stat_missing_exists_false() {
        let (_tmp, agfs) = make_fs().await;
        let stat = agfs.stat(&uri("viking://resources/nope")).await.unwrap();
        assert!(!stat.exists);
    }

    #[tokio::test]
    async fn test_stat_file_and_dir() {
        let (_tmp, agfs) = make_fs().await;
        agfs.mkdir(&uri("viking://resources/d")).await.unwrap();
        agfs.write(&uri("viking://resources/d/f.md"), b"12345", WriteOptions::default())
            .await
            .unwrap();
        let f = agfs.stat(&uri("viking://resources/d/f.md")).await.unwrap();
        assert!(f.exists && !f.is_dir);
        assert_eq!(f.size, 5);
        assert!(f.mtime.is_some());
        let d = agfs.stat(&uri("viking://resources/d")).await.unwrap();
        assert!(d.exists && d.is_dir);
    }

    #[tokio::test]
    async fn test_tree_depth_cap() {
        let (_tmp, agfs) = make_fs().await;
        agfs.mkdir(&uri("viking://resources/a/b/c")).await.unwrap();
        let node = agfs
            .tree(&uri("viking://resources"), TreeOptions { depth: Some(1), node_limit: None })
            .await
            .unwrap();
        assert_eq!(node.children.len(), 1);
        assert!(node.children[0].children.is_empty());
    }

    #[tokio::test]
    async fn test_tree_nested() {
        let (_tmp, agfs) = make_fs().await;
        agfs.mkdir(&uri("viking://resources/doc")).await.unwrap();
        agfs.write(&uri("viking://resources/doc/a.md"), b"x", WriteOptions::default())
            .await
            .unwrap();
        let node = agfs.tree(&uri("viking://resources"), TreeOptions::default()).await.unwrap();
        assert_eq!(node.children.len(), 1);
        assert_eq!(node.children[0].children.len(), 1);
        assert!(!node.children[0].children[0].entry.is_dir);
    }

    #[tokio::test]
    async fn test_delete_file() {
        let (_tmp, agfs) = make_fs().await;
        agfs.mkdir(&uri("viking://resources")).await.unwrap();
        let u = uri("viking://resources/del.txt");
        agfs.write(&u, b"x", WriteOptions::default()).await.unwrap();
        agfs.delete(&u, false).await.unwrap();
        assert!(!agfs.exists(&u).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_nonempty_requires_recursive() {
        let (_tmp, agfs) = make_fs().await;
        agfs.mkdir(&uri("viking://resources/d")).await.unwrap();
        agfs.write(&uri("viking://resources/d/f.md"), b"x", WriteOptions::default())
            .await
            .unwrap();
        let err = agfs.delete(&uri("viking://resources/d"), false).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_ARGUMENT");
        agfs.delete(&uri("viking://resources/d"), true).await.unwrap();
        assert!(!agfs.exists(&uri("viking://resources/d")).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_missing_not_found() {
        let (_tmp, agfs) = make_fs().await;
        let err = agfs.delete(&uri("viking://resources/ghost"), false).await.unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_mv_file() {
        let (_tmp, agfs) = make_fs().await;
        agfs.mkdir(&uri("viking://temp/t")).await.unwrap();
        agfs.mkdir(&uri("viking://resources")).await.unwrap();
        agfs.write(&uri("viking://temp/t/f.md"), b"data", WriteOptions::default())
            .await
            .unwrap();
        agfs.mv(&uri("viking://temp/t/f.md"), &uri("viking://resources/f.md")).await.unwrap();
        assert!(!agfs.exists(&uri("viking://temp/t/f.md")).await.unwrap());
        assert_eq!(agfs.read(&uri("viking://resources/f.md")).await.unwrap(), b"data");
    }

    #[tokio::test]
    async fn test_mv_dst_exists() {
        let (_tmp, agfs) = make_fs().await;
        agfs.mkdir(&uri("viking://resources")).await.unwrap();
        agfs.write(&uri("viking://resources/a"), b"a", WriteOptions::default()).await.unwrap();
        agfs.write(&uri("viking://resources/b"), b"b", WriteOptions::default()).await.unwrap();
        let err = agfs
            .mv(&uri("viking://resources/a"), &uri("viking://resources/b"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "ALREADY_EXISTS");
    }

    #[tokio::test]
    async fn test_mv_directory_tree() {
        let (_tmp, agfs) = make_fs().await;
        agfs.mkdir(&uri("viking://temp/t/doc/sub")).await.unwrap();
        agfs.write(&uri("viking://temp/t/doc/a.md"), b"a", WriteOptions::default())
            .await
            .unwrap();
        agfs.write(&uri("viking://temp/t/doc/sub/b.md"), b"b", WriteOptions::default())
            .await
            .unwrap();
        agfs.mkdir(&uri("viking://resources")).await.unwrap();
        agfs.mv(&uri("viking://temp/t/doc"), &uri("viking://resources/doc")).await.unwrap();
        assert!(!agfs.exists(&uri("viking://temp/t/doc")).await.unwrap());
        assert_eq!(agfs.read(&uri("viking://resources/doc/a.md")).await.unwrap(), b"a");
        assert_eq!(agfs.read(&uri("viking://resources/doc/sub/b.md")).await.unwrap(), b"b");
        assert!(!agfs.exists(&uri("viking://resources/doc/.moving")).await.unwrap());
    }

    #[tokio::test]
    async fn test_abstract_of_not_processed() {
        let (_tmp, agfs) = make_fs().await;
        agfs.mkdir(&uri("viking://resources/d")).await.unwrap();
        let err = agfs.abstract_of(&uri("viking://resources/d")).await.unwrap_err();
        assert_eq!(err.code(), "NOT_PROCESSED");
        let err = agfs.overview_of(&uri("viking://resources/d")).await.unwrap_err();
        assert_eq!(err.code(), "NOT_PROCESSED");
    }

    #[tokio::test]
    async fn test_abstract_of_present() {
        let (_tmp, agfs) = make_fs().await;
        agfs.mkdir(&uri("viking://resources/d")).await.unwrap();
        agfs.write(&uri("viking://resources/d/.overview.md"), b"## Children", WriteOptions::default())
            .await
            .unwrap();
        agfs.write(&uri("viking://resources/d/.abstract.md"), b"Purpose.", WriteOptions::default())
            .await
            .unwrap();
        assert_eq!(agfs.abstract_of(&uri("viking://resources/d")).await.unwrap(), "Purpose.");
        assert_eq!(agfs.overview_of(&uri("viking://resources/d")).await.unwrap(), "## Children");
    }

    #[tokio::test]
    async fn test_abstract_of_missing_dir() {
        let (_tmp, agfs) = make_fs().await;
        let err = agfs.abstract_of(&uri("viking://resources/ghost")).await.unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_append_creates_and_extends() {
        let (_tmp, agfs) = make_fs().await;
        agfs.mkdir(&uri("viking://.system/sessions/s1")).await.unwrap();
        let u = uri("viking://.system/sessions/s1/log.jsonl");
        agfs.append(&u, b"line1\n").await.unwrap();
        agfs.append(&u, b"line2\n").await.unwrap();
        assert_eq!(agfs.read_string(&u).await.unwrap(), "line1\nline2\n");
    }

    #[tokio::test]
    async fn test_uri_path_roundtrip() {
        let (_tmp, agfs) = make_fs().await;
        let u = uri("viking://agent/skills/search");
        let path = agfs.uri_to_path(&u);
        assert_eq!(agfs.path_to_uri(&path).unwrap(), u);
    }

    #[tokio::test]
    async fn test_concurrent_writers_distinct_files() {
        let (_tmp, agfs) = make_fs().await;
        agfs.mkdir(&uri("viking://resources")).await.unwrap();
        let agfs = std::sync::Arc::new(agfs);
        let mut handles = Vec::new();
        for i in 0..10 {
            let agfs = agfs.clone();
            handles.push(tokio::spawn(async move {
                let u = VikingUri::parse(&format!("viking://resources/c{i}.txt")).unwrap();
                agfs.write(&u, format!("data{i}").as_bytes(), WriteOptions::default())
                    .await
                    .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        let entries = agfs.ls(&uri("viking://resources"), LsOptions::default()).await.unwrap();
        assert_eq!(entries.len(), 10);
    }

    #[tokio::test]
    async fn test_unicode_content_and_names() {
        let (_tmp, agfs) = make_fs().await;
        agfs.mkdir(&uri("viking://resources")).await.unwrap();
        let u = uri("viking://resources/中文.md");
        agfs.write_string(&u, "内容", WriteOptions::default()).await.unwrap();
        assert_eq!(agfs.read_string(&u).await.unwrap(), "内容");
    }

    #[tokio::test]
    async fn test_empty_file() {
        let (_tmp, agfs) = make_fs().await;
        agfs.mkdir(&uri("viking://resources")).await.unwrap();
        let u = uri("viking://resources/empty");
        agfs.write(&u, b"", WriteOptions::default()).await.unwrap();
        assert!(agfs.read(&u).await.unwrap().is_empty());
        let stat = agfs.stat(&u).await.unwrap();
        assert!(stat.exists);
        assert_eq!(stat.size, 0);
    }
}
