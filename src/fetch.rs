//! The fetch engine: list the remote's signed tags, fetch one, verify it,
//! then pull everything it reaches that we do not already have.

use std::collections::{HashSet, VecDeque};
use std::path::Path;

use tracing::{debug, info, instrument, warn};

use crate::error::{Error, Result};
use crate::object::{GitObject, ObjectId, ObjectKind, TagName};
use crate::odb::Odb;
use crate::remote::RemoteSpec;
use crate::transport::{RpcTransport, Transport};
use crate::verifier::{TagVerifier, Verifier};

const SERVICE_LIST: &str = "git.List";
const SERVICE_LIST_HEAD_ONLY: &str = "git.ListHeadOnly";
const SERVICE_FETCH: &str = "git.Fetch";

/// One line of the remote tag listing.
#[derive(Debug, PartialEq, Eq)]
pub struct TagListing {
    pub commit: ObjectId,
    pub tag: ObjectId,
    pub name: TagName,
}

pub struct Fetcher<T = Transport, V = Verifier> {
    list_head_only: bool,
    transport: T,
    verifier: V,
    odb: Odb,
    /// Ids ingested this session. Only grows, and only after the object is
    /// resident in the local store.
    visited: HashSet<ObjectId>,
}

impl Fetcher {
    pub fn new(spec: &RemoteSpec, git_dir: &Path) -> Result<Self> {
        Ok(Fetcher::assemble(
            spec.list_head_only,
            Transport::new(spec),
            Verifier::new(spec.keyrings.clone()),
            Odb::open(git_dir)?,
        ))
    }
}

impl<T, V> Fetcher<T, V>
where
    T: RpcTransport,
    V: TagVerifier,
{
    /// Wire an engine from its parts. The seams are generic so tests can
    /// replay whole fetch sessions against a canned peer and verdict.
    fn assemble(list_head_only: bool, transport: T, verifier: V, odb: Odb) -> Self {
        Fetcher {
            list_head_only,
            transport,
            verifier,
            odb,
            visited: HashSet::new(),
        }
    }

    /// Ask the remote for its signed tags. A single malformed line poisons
    /// the whole listing; partial lists are never returned.
    pub async fn list(&self) -> Result<Vec<TagListing>> {
        let service = if self.list_head_only {
            SERVICE_LIST_HEAD_ONLY
        } else {
            SERVICE_LIST
        };
        let response = self.transport.call(service, None).await?;
        let entries = response.validate(parse_listing)?;
        if entries.is_empty() && self.list_head_only {
            warn!("remote head has no signed tag pointing at it");
        }
        Ok(entries)
    }

    /// Fetch one signed tag and the transitive closure of objects it
    /// reaches. The tag is always pulled from the remote and re-verified:
    /// the signature is what binds the requested refname to its bytes.
    #[instrument(skip(self))]
    pub async fn fetch(&mut self, id: &ObjectId, refname: &str) -> Result<()> {
        let name = tag_name_of(refname)?;

        let tag = self.fetch_remote_object(id).await?;
        if tag.kind() != ObjectKind::Tag {
            return Err(Error::KindMismatch {
                expected: ObjectKind::Tag,
                actual: tag.kind(),
            });
        }
        self.verifier.verify_tag(&tag).await?;

        // The signature covers the tag headers; now bind them to what was
        // asked for.
        match tag.header(b"tag") {
            Some(value) if value == name.as_bytes() => {}
            other => {
                return Err(Error::TagNameMismatch {
                    expected: name.to_string(),
                    actual: other
                        .map(|value| String::from_utf8_lossy(value).into_owned())
                        .unwrap_or_default(),
                })
            }
        }
        match tag.header(b"type") {
            Some(b"commit") => {}
            other => {
                return Err(Error::TagTarget {
                    target: other
                        .map(|value| String::from_utf8_lossy(value).into_owned())
                        .unwrap_or_default(),
                })
            }
        }
        let target = tag.header_oid("object")?;

        self.odb.write_loose(&tag)?;
        self.visited.insert(tag.id().clone());
        info!(tag = %name, target = %target, "tag verified, walking its history");
        self.walk(target, ObjectKind::Commit).await
    }

    async fn fetch_remote_object(&self, id: &ObjectId) -> Result<GitObject> {
        let raw = self
            .transport
            .call(SERVICE_FETCH, Some(id.as_str().as_bytes()))
            .await?;
        GitObject::parse(id, raw)
    }

    /// Walk the reachable closure with an explicit queue; history can be far
    /// deeper than any call stack. Objects already present locally are read
    /// instead of fetched, which both bounds remote calls to the delta and
    /// terminates the walk at history the user already has.
    async fn walk(&mut self, start: ObjectId, kind: ObjectKind) -> Result<()> {
        let mut queue: VecDeque<(ObjectId, Option<ObjectKind>)> = VecDeque::new();
        queue.push_back((start, Some(kind)));

        while let Some((id, hint)) = queue.pop_front() {
            if self.visited.contains(&id) {
                continue;
            }

            let object = if self.odb.contains(&id) {
                debug!(%id, "object already present locally");
                self.odb.read(&id)?
            } else {
                let object = self.fetch_remote_object(&id).await?;
                if let Some(expected) = hint {
                    if object.kind() != expected {
                        return Err(Error::KindMismatch {
                            expected,
                            actual: object.kind(),
                        });
                    }
                }
                self.odb.write_loose(&object)?;
                object
            };
            self.visited.insert(id.clone());

            match object.kind() {
                ObjectKind::Commit => {
                    queue.push_back((object.header_oid("tree")?, Some(ObjectKind::Tree)));
                    // Every parent matters; merge commits have several.
                    for parent in object.headers(b"parent") {
                        queue.push_back((ObjectId::from_bytes(parent)?, Some(ObjectKind::Commit)));
                    }
                }
                ObjectKind::Tree => {
                    for entry in self.odb.list_tree(&id)? {
                        match entry.kind {
                            Some(ObjectKind::Blob) => {
                                queue.push_back((entry.id, Some(ObjectKind::Blob)))
                            }
                            Some(ObjectKind::Tree) => {
                                queue.push_back((entry.id, Some(ObjectKind::Tree)))
                            }
                            Some(ObjectKind::Commit) => {
                                warn!(path = %entry.name, "not fetching submodule gitlink");
                            }
                            Some(ObjectKind::Tag) | None => {
                                return Err(Error::UnknownTreeEntry { path: entry.name });
                            }
                        }
                    }
                }
                ObjectKind::Blob | ObjectKind::Tag => {}
            }
        }
        Ok(())
    }
}

/// The suffix of `refs/tags/<name>`, validated as a tag name.
fn tag_name_of(refname: &str) -> Result<TagName> {
    let name = refname
        .strip_prefix("refs/tags/")
        .ok_or_else(|| Error::NotATagRef {
            refname: refname.to_string(),
        })?;
    TagName::parse(name)
}

fn parse_listing(bytes: Vec<u8>) -> Result<Vec<TagListing>> {
    let mut entries = Vec::new();
    let mut rest = bytes.as_slice();
    while !rest.is_empty() {
        let newline = rest
            .iter()
            .position(|&b| b == b'\n')
            .ok_or(Error::ListingTruncated)?;
        entries.push(parse_listing_line(&rest[..newline])?);
        rest = &rest[newline + 1..];
    }
    Ok(entries)
}

fn parse_listing_line(line: &[u8]) -> Result<TagListing> {
    let mut fields = line.splitn(3, |&b| b == b' ');
    match (fields.next(), fields.next(), fields.next()) {
        (Some(commit), Some(tag), Some(name)) if !name.is_empty() => Ok(TagListing {
            commit: ObjectId::from_bytes(commit)?,
            tag: ObjectId::from_bytes(tag)?,
            name: TagName::from_bytes(name)?,
        }),
        _ => Err(Error::ListingLine {
            line: String::from_utf8_lossy(line).into_owned(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::rc::Rc;

    use async_trait::async_trait;
    use tempdir::TempDir;

    use super::*;
    use crate::untrusted::Untrusted;

    const COMMIT_A: &str = "1111111111111111111111111111111111111111";
    const TAG_A: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    const COMMIT_B: &str = "2222222222222222222222222222222222222222";
    const TAG_B: &str = "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";

    // {{{ Listing grammar

    #[test]
    fn parses_a_two_line_listing() {
        let listing = format!(
            "{} {} v1\n{} {} v2.0\n",
            COMMIT_A, TAG_A, COMMIT_B, TAG_B
        );
        let entries = parse_listing(listing.into_bytes()).expect("listing should parse");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].commit.as_str(), COMMIT_A);
        assert_eq!(entries[0].tag.as_str(), TAG_A);
        assert_eq!(entries[0].name.as_str(), "v1");
        assert_eq!(entries[1].name.as_str(), "v2.0");
    }

    #[test]
    fn an_empty_listing_is_empty() {
        let entries = parse_listing(Vec::new()).expect("empty listing is fine");
        assert!(entries.is_empty());
    }

    #[test]
    fn rejects_a_listing_without_final_newline() {
        let listing = format!("{} {} v1", COMMIT_A, TAG_A);
        assert!(matches!(
            parse_listing(listing.into_bytes()),
            Err(Error::ListingTruncated)
        ));
    }

    #[test]
    fn one_bad_line_poisons_the_listing() {
        let listing = format!(
            "{} {} v1\nnot a listing line\n{} {} v2\n",
            COMMIT_A, TAG_A, COMMIT_B, TAG_B
        );
        assert!(parse_listing(listing.into_bytes()).is_err());
    }

    #[test]
    fn rejects_uppercase_object_ids_in_the_listing() {
        let listing = format!("{} {} v1\n", COMMIT_A.to_uppercase(), TAG_A);
        assert!(matches!(
            parse_listing(listing.into_bytes()),
            Err(Error::BadObjectId { .. })
        ));
    }

    #[test]
    fn rejects_tag_names_with_forbidden_bytes() {
        let listing = format!("{} {} v1/other\n", COMMIT_A, TAG_A);
        assert!(matches!(
            parse_listing(listing.into_bytes()),
            Err(Error::BadTagName { .. })
        ));
    }

    #[test]
    fn rejects_blank_lines_inside_the_listing() {
        let listing = format!("{} {} v1\n\n", COMMIT_A, TAG_A);
        assert!(matches!(
            parse_listing(listing.into_bytes()),
            Err(Error::ListingLine { .. })
        ));
    }

    #[test]
    fn rejects_lines_with_missing_fields() {
        assert!(matches!(
            parse_listing(format!("{} v1\n", COMMIT_A).into_bytes()),
            Err(Error::ListingLine { .. })
        ));
    }

    // }}}

    // {{{ Refname handling

    #[test]
    fn extracts_the_tag_name_from_a_tag_ref() {
        let name = tag_name_of("refs/tags/v1.2.3").expect("tag ref should parse");
        assert_eq!(name.as_str(), "v1.2.3");
    }

    #[test]
    fn refuses_refs_outside_refs_tags() {
        for refname in ["refs/heads/main", "v1", "refs/tags", ""] {
            assert!(
                matches!(tag_name_of(refname), Err(Error::NotATagRef { .. })),
                "{:?} is not a tag ref",
                refname
            );
        }
    }

    #[test]
    fn refuses_tag_refs_with_forbidden_names() {
        assert!(matches!(
            tag_name_of("refs/tags/v1 v2"),
            Err(Error::BadTagName { .. })
        ));
    }

    // }}}

    // {{{ Fetch pipeline against a canned peer

    /// A peer that serves objects out of a map and logs every service call.
    struct FakeTransport {
        objects: HashMap<String, Vec<u8>>,
        calls: Rc<RefCell<Vec<String>>>,
    }

    #[async_trait(?Send)]
    impl RpcTransport for FakeTransport {
        async fn call(&self, service: &str, input: Option<&[u8]>) -> Result<Untrusted<Vec<u8>>> {
            self.calls.borrow_mut().push(service.to_string());
            let wanted = input
                .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
                .unwrap_or_default();
            self.objects
                .get(&wanted)
                .cloned()
                .map(Untrusted::new)
                .ok_or(Error::Command { exit_code: 2 })
        }
    }

    struct ApproveAll;

    #[async_trait(?Send)]
    impl TagVerifier for ApproveAll {
        async fn verify_tag(&self, tag: &GitObject) -> Result<Vec<u8>> {
            Ok(tag.content().to_vec())
        }
    }

    struct RejectAll;

    #[async_trait(?Send)]
    impl TagVerifier for RejectAll {
        async fn verify_tag(&self, _tag: &GitObject) -> Result<Vec<u8>> {
            Err(Error::SignatureRejected { exit_code: 2 })
        }
    }

    fn scratch_repo() -> (TempDir, PathBuf) {
        let dir = TempDir::new("git-remote-qrexec-fetch").expect("tempdir");
        git2::Repository::init(dir.path()).expect("init repository");
        let git_dir = dir.path().join(".git");
        (dir, git_dir)
    }

    fn store_object(objects: &mut HashMap<String, Vec<u8>>, kind: &str, content: &[u8]) -> ObjectId {
        let mut raw = format!("{} {}\0", kind, content.len()).into_bytes();
        raw.extend_from_slice(content);
        let id = ObjectId::hash(&raw);
        objects.insert(id.to_string(), raw);
        id
    }

    fn tree_entry(mode: &str, name: &str, id: &ObjectId) -> Vec<u8> {
        let mut entry = format!("{} {}\0", mode, name).into_bytes();
        entry.extend_from_slice(&hex::decode(id.as_str()).expect("fixture ids are hex"));
        entry
    }

    fn commit_content(tree: &ObjectId, parents: &[&ObjectId], message: &str) -> Vec<u8> {
        let mut content = format!("tree {}\n", tree);
        for parent in parents {
            content.push_str(&format!("parent {}\n", parent));
        }
        content.push_str("author A U Thor <author@example.com> 1465818665 +0200\n");
        content.push_str("committer A U Thor <author@example.com> 1465818665 +0200\n");
        content.push('\n');
        content.push_str(message);
        content.into_bytes()
    }

    fn tag_content(name: &str, target: &ObjectId, target_kind: &str) -> Vec<u8> {
        format!(
            "object {}\ntype {}\ntag {}\n\
             tagger A U Thor <author@example.com> 1465818665 +0200\n\
             \nrelease {}\n\
             -----BEGIN PGP SIGNATURE-----\n\niQEzBAABCAAdFiEEexample\n\
             -----END PGP SIGNATURE-----\n",
            target, target_kind, name, name
        )
        .into_bytes()
    }

    fn fake_fetcher<V: TagVerifier>(
        objects: HashMap<String, Vec<u8>>,
        verifier: V,
        git_dir: &Path,
    ) -> (Fetcher<FakeTransport, V>, Rc<RefCell<Vec<String>>>) {
        let calls = Rc::new(RefCell::new(Vec::new()));
        let transport = FakeTransport {
            objects,
            calls: Rc::clone(&calls),
        };
        let odb = Odb::open(git_dir).expect("open odb");
        (Fetcher::assemble(true, transport, verifier, odb), calls)
    }

    /// Every loose object file under `objects/`, as 40-hex names.
    fn loose_objects(git_dir: &Path) -> Vec<String> {
        let mut found = Vec::new();
        for dir in std::fs::read_dir(git_dir.join("objects")).expect("objects dir") {
            let dir = dir.expect("directory entry");
            let fanout = dir.file_name().to_string_lossy().into_owned();
            if fanout.len() != 2 {
                // info/ and pack/ are git's own
                continue;
            }
            for file in std::fs::read_dir(dir.path()).expect("fanout dir") {
                let file = file.expect("file entry");
                found.push(format!("{}{}", fanout, file.file_name().to_string_lossy()));
            }
        }
        found.sort();
        found
    }

    #[tokio::test]
    async fn fetches_the_full_closure_of_a_signed_tag() {
        let (_dir, git_dir) = scratch_repo();
        let mut objects = HashMap::new();
        let blob_a = store_object(&mut objects, "blob", b"hello\n");
        let blob_b = store_object(&mut objects, "blob", b"world\n");
        let tree = {
            let mut bytes = tree_entry("100644", "a.txt", &blob_a);
            bytes.extend(tree_entry("100644", "b.txt", &blob_b));
            store_object(&mut objects, "tree", &bytes)
        };
        // Two unrelated roots merged: only a walk that follows every parent
        // header reaches both.
        let left = store_object(&mut objects, "commit", &commit_content(&tree, &[], "left root\n"));
        let right = store_object(
            &mut objects,
            "commit",
            &commit_content(&tree, &[], "right root\n"),
        );
        let merge = store_object(
            &mut objects,
            "commit",
            &commit_content(&tree, &[&left, &right], "merge\n"),
        );
        let tag = store_object(&mut objects, "tag", &tag_content("v1", &merge, "commit"));

        let (mut fetcher, calls) = fake_fetcher(objects, ApproveAll, &git_dir);
        fetcher
            .fetch(&tag, "refs/tags/v1")
            .await
            .expect("fetch should succeed");

        let stored = loose_objects(&git_dir);
        assert_eq!(stored.len(), 7, "tag + 3 commits + 1 tree + 2 blobs");
        for id in [&tag, &merge, &left, &right, &tree, &blob_a, &blob_b] {
            assert!(stored.contains(&id.to_string()), "{} should be stored", id);
        }

        // A second fetch re-verifies the tag and nothing else: no new
        // writes, no remote calls beyond the tag itself.
        let calls_before = calls.borrow().len();
        fetcher
            .fetch(&tag, "refs/tags/v1")
            .await
            .expect("second fetch should succeed");
        assert_eq!(calls.borrow().len(), calls_before + 1);
        assert_eq!(loose_objects(&git_dir).len(), 7);
    }

    #[tokio::test]
    async fn a_tampered_tag_is_rejected_before_any_write() {
        let (_dir, git_dir) = scratch_repo();
        let mut objects = HashMap::new();
        let target = ObjectId::from_hex(COMMIT_A).expect("fixture id");
        let tag = store_object(&mut objects, "tag", &tag_content("v1", &target, "commit"));
        let raw = objects.get_mut(tag.as_str()).expect("tag bytes");
        let last = raw.len() - 1;
        raw[last] ^= 0x01;

        let (mut fetcher, _calls) = fake_fetcher(objects, ApproveAll, &git_dir);
        let result = fetcher.fetch(&tag, "refs/tags/v1").await;
        assert!(matches!(result, Err(Error::ObjectIdMismatch { .. })));
        assert!(loose_objects(&git_dir).is_empty(), "nothing may be persisted");
    }

    #[tokio::test]
    async fn a_tag_naming_another_ref_is_not_persisted() {
        let (_dir, git_dir) = scratch_repo();
        let mut objects = HashMap::new();
        let target = ObjectId::from_hex(COMMIT_A).expect("fixture id");
        let tag = store_object(&mut objects, "tag", &tag_content("v2", &target, "commit"));

        let (mut fetcher, _calls) = fake_fetcher(objects, ApproveAll, &git_dir);
        let result = fetcher.fetch(&tag, "refs/tags/v1").await;
        assert!(matches!(result, Err(Error::TagNameMismatch { .. })));
        assert!(loose_objects(&git_dir).is_empty());
    }

    #[tokio::test]
    async fn a_rejected_signature_stops_the_fetch_cold() {
        let (_dir, git_dir) = scratch_repo();
        let mut objects = HashMap::new();
        let tree = store_object(&mut objects, "tree", &[]);
        let commit = store_object(&mut objects, "commit", &commit_content(&tree, &[], "tip\n"));
        let tag = store_object(&mut objects, "tag", &tag_content("v1", &commit, "commit"));

        let (mut fetcher, calls) = fake_fetcher(objects, RejectAll, &git_dir);
        let result = fetcher.fetch(&tag, "refs/tags/v1").await;
        assert!(matches!(result, Err(Error::SignatureRejected { .. })));
        assert!(
            loose_objects(&git_dir).is_empty(),
            "a rejected tag is not persisted"
        );
        assert_eq!(calls.borrow().len(), 1, "no descent past the rejected tag");
    }

    #[tokio::test]
    async fn submodule_gitlinks_are_recorded_but_not_followed() {
        let (_dir, git_dir) = scratch_repo();
        let mut objects = HashMap::new();
        let blob = store_object(&mut objects, "blob", b"hello\n");
        // The gitlink commit lives on the far side of the submodule; the
        // canned peer cannot serve it, so following it would fail the test.
        let gitlink = ObjectId::from_hex(COMMIT_B).expect("fixture id");
        let tree = {
            let mut bytes = tree_entry("100644", "a.txt", &blob);
            bytes.extend(tree_entry("160000", "lib", &gitlink));
            store_object(&mut objects, "tree", &bytes)
        };
        let commit = store_object(&mut objects, "commit", &commit_content(&tree, &[], "tip\n"));
        let tag = store_object(&mut objects, "tag", &tag_content("v1", &commit, "commit"));

        let (mut fetcher, _calls) = fake_fetcher(objects, ApproveAll, &git_dir);
        fetcher
            .fetch(&tag, "refs/tags/v1")
            .await
            .expect("gitlinks must not fail the fetch");

        let stored = loose_objects(&git_dir);
        assert_eq!(stored.len(), 4, "tag + commit + tree + blob");
        assert!(
            !stored.contains(&gitlink.to_string()),
            "the gitlink commit is not ingested"
        );
    }

    #[tokio::test]
    async fn a_tag_of_a_tree_is_rejected() {
        let (_dir, git_dir) = scratch_repo();
        let mut objects = HashMap::new();
        let tree = store_object(&mut objects, "tree", &[]);
        let tag = store_object(&mut objects, "tag", &tag_content("v1", &tree, "tree"));

        let (mut fetcher, _calls) = fake_fetcher(objects, ApproveAll, &git_dir);
        let result = fetcher.fetch(&tag, "refs/tags/v1").await;
        assert!(matches!(result, Err(Error::TagTarget { .. })));
        assert!(loose_objects(&git_dir).is_empty());
    }

    // }}}
}
