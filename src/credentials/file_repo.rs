use std::{
    fs::{self, File, OpenOptions},
    io::{self, Read, Write},
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use nix::fcntl::{Flock, FlockArg};
use tracing::{debug, instrument, warn};

use crate::credentials::{
    codec::{decode_store, encode},
    error::StoreError,
    repo_types::{emails_match, NewUser, UserRecord},
    CredentialBackend,
};

/// Credentials in a shared, append-only, newline-delimited file.
///
/// Registration reads, checks and appends under an exclusive `flock`, so
/// concurrent writers (threads, tasks or other processes) are serialised.
/// Lookups take a shared lock and therefore never see a half-written line.
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    path: PathBuf,
}

impl FileCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the parent directory ahead of the first write.
    pub async fn prepare(&self) -> Result<(), StoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || ensure_parent_dir(&path)).await??;
        Ok(())
    }
}

#[async_trait]
impl CredentialBackend for FileCredentialStore {
    fn kind(&self) -> &'static str {
        "file"
    }

    #[instrument(skip(self, new_user), fields(path = %self.path.display(), email = %new_user.email))]
    async fn register(&self, new_user: NewUser) -> Result<i64, StoreError> {
        let path = self.path.clone();
        let id = tokio::task::spawn_blocking(move || append_exclusive(&path, new_user)).await??;
        debug!(user_id = id, "user record appended");
        Ok(id)
    }

    async fn lookup_by_email(&self, email: &str) -> Result<Option<UserRecord>, StoreError> {
        let path = self.path.clone();
        let email = email.to_owned();
        let user =
            tokio::task::spawn_blocking(move || find_shared(&path, &email)).await??;
        Ok(user)
    }
}

fn ensure_parent_dir(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => fs::create_dir_all(dir),
        _ => Ok(()),
    }
}

fn lock(file: File, arg: FlockArg) -> io::Result<Flock<File>> {
    Flock::lock(file, arg).map_err(|(_, errno)| io::Error::from(errno))
}

fn read_contents(file: &mut File) -> io::Result<String> {
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn well_formed(path: &Path, contents: &str, include_unterminated: bool) -> Vec<UserRecord> {
    decode_store(contents, include_unterminated)
        .into_iter()
        .filter_map(|line| match line.record {
            Ok(user) => Some(user),
            Err(reason) => {
                warn!(
                    path = %path.display(),
                    line = line.line_no,
                    reason = %reason,
                    "skipping malformed user record"
                );
                None
            }
        })
        .collect()
}

/// The whole read-check-append sequence runs while the exclusive lock is
/// held; dropping the guard on any return path releases it.
fn append_exclusive(path: &Path, new_user: NewUser) -> Result<i64, StoreError> {
    ensure_parent_dir(path)?;
    let file = OpenOptions::new()
        .read(true)
        .append(true)
        .create(true)
        .open(path)?;
    let mut file = lock(file, FlockArg::LockExclusive)?;
    let contents = read_contents(&mut file)?;

    // An unterminated tail gets sealed by this write, so it counts as a record here.
    let existing = well_formed(path, &contents, true);
    if existing
        .iter()
        .any(|user| emails_match(&user.email, &new_user.email))
    {
        warn!(path = %path.display(), "email already registered");
        return Err(StoreError::DuplicateEmail);
    }

    let id = existing
        .iter()
        .map(|user| user.id)
        .max()
        .unwrap_or(0)
        .checked_add(1)
        .ok_or_else(|| io::Error::other("user id space exhausted"))?;
    let record = new_user.with_id(id);

    let mut buf = String::new();
    if !contents.is_empty() && !contents.ends_with('\n') {
        buf.push('\n');
    }
    buf.push_str(&encode(&record)?);
    buf.push('\n');

    file.write_all(buf.as_bytes())?;
    file.sync_data()?;
    Ok(id)
}

fn find_shared(path: &Path, email: &str) -> Result<Option<UserRecord>, StoreError> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let mut file = lock(file, FlockArg::LockShared)?;
    let contents = read_contents(&mut file)?;
    drop(file);

    Ok(well_formed(path, &contents, false)
        .into_iter()
        .find(|user| emails_match(&user.email, email)))
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, sync::Arc};

    use tempfile::TempDir;

    use super::*;

    fn test_store() -> (TempDir, FileCredentialStore) {
        let tmp = TempDir::new().unwrap();
        let store = FileCredentialStore::new(tmp.path().join("data").join("users.txt"));
        (tmp, store)
    }

    fn new_user(name: &str, email: &str) -> NewUser {
        NewUser {
            name: name.into(),
            email: email.into(),
            password_hash: format!("$argon2id$v=19$m=1024,t=1,p=1$salt${name}"),
        }
    }

    fn line_for(id: i64, email: &str) -> String {
        encode(&new_user("Seeded", email).with_id(id)).unwrap()
    }

    #[tokio::test]
    async fn absent_file_is_an_empty_store() {
        let (_tmp, store) = test_store();
        assert!(store.lookup_by_email("a@x.com").await.unwrap().is_none());
        assert!(!store.path().exists());
    }

    #[tokio::test]
    async fn first_register_creates_directory_and_file() {
        let (_tmp, store) = test_store();
        let id = store.register(new_user("Ada", "ada@x.com")).await.unwrap();
        assert_eq!(id, 1);

        let contents = fs::read_to_string(store.path()).unwrap();
        assert_eq!(contents.lines().count(), 1);
        assert!(contents.ends_with('\n'));

        let found = store.lookup_by_email("ada@x.com").await.unwrap().unwrap();
        assert_eq!(found.id, 1);
        assert_eq!(found.name, "Ada");
    }

    #[tokio::test]
    async fn prepare_creates_parent_directory_only() {
        let (_tmp, store) = test_store();
        store.prepare().await.unwrap();
        assert!(store.path().parent().unwrap().is_dir());
        assert!(!store.path().exists());
    }

    #[tokio::test]
    async fn ids_increase_from_max_not_count() {
        let (_tmp, store) = test_store();
        store.prepare().await.unwrap();
        fs::write(
            store.path(),
            format!("{}\n{}\n", line_for(1, "a@x.com"), line_for(5, "b@x.com")),
        )
        .unwrap();

        let id = store.register(new_user("C", "c@x.com")).await.unwrap();
        assert_eq!(id, 6);
        let id = store.register(new_user("D", "d@x.com")).await.unwrap();
        assert_eq!(id, 7);
    }

    #[tokio::test]
    async fn duplicate_email_is_case_insensitive_and_writes_nothing() {
        let (_tmp, store) = test_store();
        store.register(new_user("A", "a@x.com")).await.unwrap();
        let before = fs::read_to_string(store.path()).unwrap();

        let err = store.register(new_user("A2", "A@X.COM")).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateEmail));
        assert_eq!(fs::read_to_string(store.path()).unwrap(), before);

        let found = store.lookup_by_email("A@x.Com").await.unwrap().unwrap();
        assert_eq!(found.email, "a@x.com");
    }

    #[tokio::test]
    async fn non_ascii_case_variant_is_a_duplicate() {
        let (_tmp, store) = test_store();
        store.register(new_user("É", "élodie@x.com")).await.unwrap();

        let err = store
            .register(new_user("É2", "ÉLODIE@X.COM"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateEmail));
        assert!(store.lookup_by_email("ÉLODIE@x.com").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn corrupted_line_is_skipped() {
        let (_tmp, store) = test_store();
        store.prepare().await.unwrap();
        let good = line_for(1, "good@x.com");
        fs::write(store.path(), format!("{good}\n{{\"id\":2,\"na\n")).unwrap();

        let found = store.lookup_by_email("good@x.com").await.unwrap().unwrap();
        assert_eq!(found.id, 1);

        let id = store.register(new_user("New", "new@x.com")).await.unwrap();
        assert_eq!(id, 2);

        let contents = fs::read_to_string(store.path()).unwrap();
        assert!(contents.starts_with(&format!("{good}\n")));
        assert!(store.lookup_by_email("good@x.com").await.unwrap().is_some());
        assert!(store.lookup_by_email("new@x.com").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn invalid_utf8_line_is_skipped() {
        let (_tmp, store) = test_store();
        store.prepare().await.unwrap();
        let mut bytes = format!("{}\n", line_for(1, "good@x.com")).into_bytes();
        bytes.extend_from_slice(&[0xff, 0xfe, b'{', b'\n']);
        fs::write(store.path(), bytes).unwrap();

        assert!(store.lookup_by_email("good@x.com").await.unwrap().is_some());
        assert_eq!(store.register(new_user("B", "b@x.com")).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn unterminated_tail_is_skipped_then_sealed() {
        let (_tmp, store) = test_store();
        store.prepare().await.unwrap();
        let good = line_for(1, "good@x.com");
        fs::write(store.path(), format!("{good}\n{{\"id\":9,\"email\":\"half")).unwrap();

        assert!(store.lookup_by_email("half").await.unwrap().is_none());

        let id = store.register(new_user("B", "b@x.com")).await.unwrap();
        assert_eq!(id, 2);

        let contents = fs::read_to_string(store.path()).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], good);
        assert_eq!(lines[1], "{\"id\":9,\"email\":\"half");
        assert_eq!(crate::credentials::codec::decode(lines[2]).unwrap().id, 2);
    }

    #[tokio::test]
    async fn complete_unterminated_record_counts_before_sealing() {
        let (_tmp, store) = test_store();
        store.prepare().await.unwrap();
        fs::write(store.path(), line_for(4, "tail@x.com")).unwrap();

        // Invisible to readers while unterminated.
        assert!(store.lookup_by_email("tail@x.com").await.unwrap().is_none());

        let err = store.register(new_user("T", "TAIL@x.com")).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateEmail));

        assert_eq!(store.register(new_user("U", "u@x.com")).await.unwrap(), 5);
        assert!(store.lookup_by_email("tail@x.com").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn unreadable_location_is_an_io_error() {
        let tmp = TempDir::new().unwrap();
        let blocker = tmp.path().join("blocker");
        fs::write(&blocker, "not a directory").unwrap();
        let store = FileCredentialStore::new(blocker.join("users.txt"));

        let err = store.register(new_user("A", "a@x.com")).await.unwrap_err();
        assert!(matches!(err, StoreError::Io(_)));
        let err = store.lookup_by_email("a@x.com").await.unwrap_err();
        assert!(matches!(err, StoreError::Io(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_same_email_registers_once() {
        let (_tmp, store) = test_store();

        let handles: Vec<_> = (0..16)
            .map(|i| {
                // separate instances: exclusion must come from the file lock
                let store = FileCredentialStore::new(store.path());
                tokio::spawn(async move {
                    store
                        .register(new_user(&format!("Racer{i}"), "race@x.com"))
                        .await
                })
            })
            .collect();

        let mut ok = 0;
        let mut dup = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(id) => {
                    assert_eq!(id, 1);
                    ok += 1;
                }
                Err(StoreError::DuplicateEmail) => dup += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(ok, 1);
        assert_eq!(dup, 15);
        assert_eq!(fs::read_to_string(store.path()).unwrap().lines().count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_distinct_emails_get_consecutive_unique_ids() {
        let (_tmp, store) = test_store();
        let store = Arc::new(store);

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    store
                        .register(new_user("User", &format!("user{i}@x.com")))
                        .await
                })
            })
            .collect();

        let mut ids = HashSet::new();
        for handle in handles {
            let id = handle.await.unwrap().unwrap();
            assert!(ids.insert(id), "id {id} assigned twice");
        }
        assert_eq!(ids, (1..=16).collect::<HashSet<i64>>());

        // File order is write order, so ids appear strictly increasing.
        let contents = fs::read_to_string(store.path()).unwrap();
        let file_ids: Vec<i64> = contents
            .lines()
            .map(|l| crate::credentials::codec::decode(l).unwrap().id)
            .collect();
        assert!(file_ids.windows(2).all(|w| w[0] < w[1]));
    }
}
