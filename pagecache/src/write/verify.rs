use super::Inner;
use crate::{
    page,
    storage::{File, Storage},
};
use rayon::prelude::*;
use tracing::{debug, warn};

/// A page that failed verification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerificationError {
    pub file: String,
    pub page_index: u64,
    pub magic_mismatch: bool,
    pub checksum_mismatch: bool,
}

impl<S: Storage> Inner<S> {
    /// Check every written page of every open file, in parallel across files.
    pub(super) fn verify(&self) -> Vec<VerificationError> {
        let files: Vec<_> = self
            .open_files()
            .into_iter()
            .map(|(_, entry, handle)| (entry.name(), handle))
            .collect();
        let page_size = self.page_size;
        let errors: Vec<_> = files
            .par_iter()
            .map(|(name, handle)| verify_file(name, handle.as_ref(), page_size))
            .collect::<Vec<_>>()
            .into_iter()
            .flatten()
            .collect();
        debug!(files = files.len(), errors = errors.len(), "pages verified");
        errors
    }
}

/// Check the pages of one file. A page that cannot be read ends the scan of that file.
fn verify_file<F: File>(name: &str, file: &F, page_size: usize) -> Vec<VerificationError> {
    let size = match file.size() {
        Ok(size) => size,
        Err(err) => {
            warn!(name, ?err, "unable to size file");
            return Vec::new();
        }
    };
    let mut errors = Vec::new();
    let mut buf = vec![0u8; page_size];
    for page_index in 0..size / page_size as u64 {
        if let Err(err) = file.read_at(&mut buf, page_index * page_size as u64) {
            warn!(name, page_index, ?err, "unable to read page");
            break;
        }
        let check = page::check(&buf);
        if !check.is_valid() {
            warn!(name, page_index, ?check, "page failed verification");
            errors.push(VerificationError {
                file: name.into(),
                page_index,
                magic_mismatch: !check.magic_matches,
                checksum_mismatch: !check.checksum_matches,
            });
        }
    }
    errors
}
