//! The local object database: an oracle for "do we already have this object"
//! plus the loose-object writer used to persist verified objects.

use std::io::Write;
use std::path::{Path, PathBuf};

use flate2::write::ZlibEncoder;
use flate2::Compression;
use git2::Repository;
use tracing::debug;

use crate::error::{Error, Result};
use crate::object::{GitObject, ObjectId, ObjectKind};

/// One entry of a tree, as enumerated by the local plumbing. `kind` is `None`
/// for entry types this tool has no business following.
pub struct TreeEntry {
    pub id: ObjectId,
    pub kind: Option<ObjectKind>,
    pub name: String,
}

pub struct Odb {
    repo: Repository,
    objects_dir: PathBuf,
}

impl Odb {
    /// Open the object database under the git directory the parent process
    /// gave us.
    pub fn open(git_dir: &Path) -> Result<Self> {
        let repo = Repository::open(git_dir)?;
        Ok(Odb {
            repo,
            objects_dir: git_dir.join("objects"),
        })
    }

    /// Whether the object is already present locally. Oracle failures count
    /// as "not present": the caller falls through to a verified remote fetch,
    /// which is always safe.
    pub fn contains(&self, id: &ObjectId) -> bool {
        let oid = match git2::Oid::from_str(id.as_str()) {
            Ok(oid) => oid,
            Err(_) => return false,
        };
        match self.repo.odb() {
            Ok(odb) => odb.exists(oid),
            Err(error) => {
                debug!(%id, %error, "object database probe failed, treating as absent");
                false
            }
        }
    }

    /// Read an object that the oracle reported present. Local objects are
    /// trusted; they were either verified by this tool earlier or put there
    /// by the owner of the repository.
    pub fn read(&self, id: &ObjectId) -> Result<GitObject> {
        let oid = git2::Oid::from_str(id.as_str())?;
        let odb = self.repo.odb()?;
        let object = odb.read(oid)?;
        let kind = ObjectKind::from_git2(object.kind()).ok_or_else(|| Error::UnknownObjectKind {
            found: object.kind().to_string(),
        })?;
        GitObject::from_local(id.clone(), kind, object.data())
    }

    /// Enumerate the entries of a tree already resident in the local store.
    pub fn list_tree(&self, id: &ObjectId) -> Result<Vec<TreeEntry>> {
        let oid = git2::Oid::from_str(id.as_str())?;
        let tree = self.repo.find_tree(oid)?;
        let mut entries = Vec::with_capacity(tree.len());
        for entry in tree.iter() {
            let entry_id = ObjectId::from_hex(&entry.id().to_string())?;
            let kind = entry.kind().and_then(ObjectKind::from_git2);
            entries.push(TreeEntry {
                id: entry_id,
                kind,
                name: String::from_utf8_lossy(entry.name_bytes()).into_owned(),
            });
        }
        Ok(entries)
    }

    /// Persist a verified object as a zlib-deflated loose object. Existing
    /// files are never rewritten; the store is content-addressed, so a file
    /// that is already there is already correct. Returns whether a new file
    /// was written.
    pub fn write_loose(&self, object: &GitObject) -> Result<bool> {
        let (fanout, rest) = object.id().path_parts();
        let dir = self.objects_dir.join(fanout);
        let path = dir.join(rest);
        if path.exists() {
            debug!(id = %object.id(), "object already present, not rewriting");
            return Ok(false);
        }
        std::fs::create_dir_all(&dir)?;

        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(object.raw())?;
        let compressed = encoder.finish()?;
        std::fs::write(&path, compressed)?;
        debug!(id = %object.id(), kind = %object.kind(), size = object.size(), "stored loose object");
        Ok(true)
    }
}
