//! On-disk store for generated certificates: a textual `index.txt`, a
//! `certs/` directory of PEM bundles named by serial, and a `size` file with
//! the current byte total. Mutations hold an exclusive advisory lock on
//! `index.txt`.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use log::debug;
use nix::fcntl::{Flock, FlockArg};

use crate::errors::CertDbError;
use crate::http::date::mkrfc1123;
use crate::utils::clock;

const INDEX_FILE: &str = "index.txt";
const SIZE_FILE: &str = "size";
const CERTS_DIR: &str = "certs";

pub struct CertificateDb {
    dir: PathBuf,
}

impl CertificateDb {
    /// Open (creating as needed) a certificate db rooted at `dir`.
    pub fn open(dir: &Path) -> Result<CertificateDb, CertDbError> {
        fs::create_dir_all(dir.join(CERTS_DIR))?;
        for name in [INDEX_FILE, SIZE_FILE] {
            let path = dir.join(name);
            if !path.exists() {
                let mut f = File::create(&path)?;
                if name == SIZE_FILE {
                    f.write_all(b"0\n")?;
                }
            }
        }
        Ok(CertificateDb {
            dir: dir.to_path_buf(),
        })
    }

    fn lock_index(&self) -> Result<Flock<File>, CertDbError> {
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .open(self.dir.join(INDEX_FILE))?;
        Flock::lock(file, FlockArg::LockExclusive).map_err(|_| CertDbError::Locked)
    }

    fn read_size_locked(&self) -> Result<u64, CertDbError> {
        let text = fs::read_to_string(self.dir.join(SIZE_FILE))?;
        text.trim().parse().map_err(|_| CertDbError::CorruptSize)
    }

    fn write_size_locked(&self, size: u64) -> Result<(), CertDbError> {
        fs::write(self.dir.join(SIZE_FILE), format!("{size}\n"))?;
        Ok(())
    }

    fn cert_path(&self, serial: &str) -> PathBuf {
        self.dir.join(CERTS_DIR).join(format!("{serial}.pem"))
    }

    /// Record one generated certificate bundle under its serial.
    pub fn store(
        &self,
        serial: &str,
        subject: &str,
        expires: i64,
        pem: &[u8],
    ) -> Result<(), CertDbError> {
        let mut index = self.lock_index()?;

        let path = self.cert_path(serial);
        fs::write(&path, pem)?;

        writeln!(
            index,
            "V\t{}\t\t{serial}\tunknown\t{subject}",
            mkrfc1123(expires)
        )?;
        index.flush()?;

        let size = self.read_size_locked()? + pem.len() as u64;
        self.write_size_locked(size)?;
        debug!("certificate db: stored {serial} ({} bytes total)", size);
        Ok(())
    }

    /// Fetch a stored bundle by serial.
    pub fn find(&self, serial: &str) -> Result<Option<Vec<u8>>, CertDbError> {
        let _lock = self.lock_index()?;
        let path = self.cert_path(serial);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(fs::read(path)?))
    }

    /// Remove a stored bundle and account its bytes back.
    pub fn remove(&self, serial: &str) -> Result<bool, CertDbError> {
        let _lock = self.lock_index()?;
        let path = self.cert_path(serial);
        if !path.exists() {
            return Ok(false);
        }
        let len = fs::metadata(&path)?.len();
        fs::remove_file(path)?;
        let size = self.read_size_locked()?.saturating_sub(len);
        self.write_size_locked(size)?;
        Ok(true)
    }

    /// Current on-disk byte total, per the `size` file.
    pub fn disk_size(&self) -> Result<u64, CertDbError> {
        let _lock = self.lock_index()?;
        self.read_size_locked()
    }

    /// Drop entries expired as of now; returns how many were removed.
    pub fn sweep_expired(&self) -> Result<usize, CertDbError> {
        let serials: Vec<String> = {
            let _lock = self.lock_index()?;
            let now = clock::current_time();
            let index = fs::read_to_string(self.dir.join(INDEX_FILE))?;
            index
                .lines()
                .filter_map(|line| {
                    let mut cols = line.split('\t');
                    let _status = cols.next()?;
                    let expiry = cols.next()?;
                    let _ = cols.next()?;
                    let serial = cols.next()?;
                    match crate::http::date::parse_rfc1123(expiry) {
                        Some(t) if t <= now => Some(serial.to_string()),
                        _ => None,
                    }
                })
                .collect()
        };
        let mut removed = 0;
        for serial in serials {
            if self.remove(&serial)? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_find_and_size_accounting() {
        crate::utils::clock::update_current_time();
        let tmp = tempfile::tempdir().unwrap();
        let db = CertificateDb::open(tmp.path()).unwrap();

        assert_eq!(db.disk_size().unwrap(), 0);
        assert!(db.find("01").unwrap().is_none());

        let pem = b"-----BEGIN CERTIFICATE-----\nfake\n-----END CERTIFICATE-----\n";
        db.store("01", "/CN=example.com", clock::current_time() + 3600, pem)
            .unwrap();

        assert_eq!(db.find("01").unwrap().unwrap(), pem);
        assert_eq!(db.disk_size().unwrap(), pem.len() as u64);

        let index = fs::read_to_string(tmp.path().join("index.txt")).unwrap();
        assert!(index.contains("/CN=example.com"));
        assert!(index.starts_with('V'));

        assert!(db.remove("01").unwrap());
        assert_eq!(db.disk_size().unwrap(), 0);
        assert!(!db.remove("01").unwrap());
    }

    #[test]
    fn test_sweep_drops_only_expired() {
        crate::utils::clock::update_current_time();
        let tmp = tempfile::tempdir().unwrap();
        let db = CertificateDb::open(tmp.path()).unwrap();
        let now = clock::current_time();

        db.store("aa", "/CN=old", now - 10, b"old-pem").unwrap();
        db.store("bb", "/CN=new", now + 3600, b"new-pem").unwrap();

        assert_eq!(db.sweep_expired().unwrap(), 1);
        assert!(db.find("aa").unwrap().is_none());
        assert!(db.find("bb").unwrap().is_some());
    }
}
