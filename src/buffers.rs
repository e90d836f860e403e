// buffers.rs — Device buffer registry shared by both compute backends.
//
// A `BufferSet<B>` owns the backend's buffer objects (`wgpu::Buffer` on the
// GPU, a word vector on the CPU reference device) and hands out opaque
// `BufferId`s. The orchestrator only ever holds ids; the backend resolves
// them at launch time.
//
// RELEASE ORDER
// ─────────────
// Buffers are released in strict reverse creation order. `Vec` drops its
// elements front to back, so `Drop` pops from the back instead of relying
// on the default field drop.
//
// ACCESS KINDS
// ────────────
//   Input   host → device once, read-only for kernels
//   Output  written by kernels, read back by the host
//   Scratch read-write intermediates; host may seed or inspect them
//   Table   small host-built lookup tables, read-only for kernels

use crate::error::{Result, SegmentError};

/// Opaque handle to a buffer owned by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub(crate) u32);

/// Host-side access policy of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    Input,
    Output,
    Scratch,
    Table,
}

impl BufferKind {
    /// Whether the host may upload into a buffer of this kind.
    pub fn host_writable(self) -> bool {
        !matches!(self, BufferKind::Output)
    }

    /// Whether the host may read a buffer of this kind back.
    pub fn host_readable(self) -> bool {
        matches!(self, BufferKind::Output | BufferKind::Scratch)
    }
}

/// Allocation request: a label for diagnostics, an access kind, and an
/// exact size in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferSpec {
    pub label: &'static str,
    pub kind: BufferKind,
    pub size: u64,
}

impl BufferSpec {
    pub fn new(label: &'static str, kind: BufferKind, size: u64) -> Self {
        BufferSpec { label, kind, size }
    }
}

struct Entry<B> {
    id: BufferId,
    spec: BufferSpec,
    resource: Option<B>,
}

/// Registry of live buffers in creation order.
pub struct BufferSet<B> {
    entries: Vec<Entry<B>>,
    next_id: u32,
}

impl<B> Default for BufferSet<B> {
    fn default() -> Self {
        BufferSet { entries: Vec::new(), next_id: 0 }
    }
}

impl<B> BufferSet<B> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly allocated resource and return its handle.
    pub fn insert(&mut self, spec: BufferSpec, resource: B) -> BufferId {
        let id = BufferId(self.next_id);
        self.next_id += 1;
        self.entries.push(Entry { id, spec, resource: Some(resource) });
        id
    }

    fn entry(&self, id: BufferId) -> Result<&Entry<B>> {
        self.entries
            .iter()
            .find(|e| e.id == id)
            .ok_or(SegmentError::UnknownBuffer(id))
    }

    fn entry_mut(&mut self, id: BufferId) -> Result<&mut Entry<B>> {
        self.entries
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or(SegmentError::UnknownBuffer(id))
    }

    pub fn spec(&self, id: BufferId) -> Result<&BufferSpec> {
        self.entry(id).map(|e| &e.spec)
    }

    pub fn get(&self, id: BufferId) -> Result<&B> {
        self.entry(id)?
            .resource
            .as_ref()
            .ok_or(SegmentError::UnknownBuffer(id))
    }

    pub fn get_mut(&mut self, id: BufferId) -> Result<&mut B> {
        self.entry_mut(id)?
            .resource
            .as_mut()
            .ok_or(SegmentError::UnknownBuffer(id))
    }

    /// Temporarily move a resource out, e.g. to hold it mutably while other
    /// buffers of the same set are borrowed. Pair with [`restore`].
    ///
    /// [`restore`]: BufferSet::restore
    pub fn take(&mut self, id: BufferId) -> Result<B> {
        self.entry_mut(id)?
            .resource
            .take()
            .ok_or(SegmentError::UnknownBuffer(id))
    }

    pub fn restore(&mut self, id: BufferId, resource: B) -> Result<()> {
        self.entry_mut(id)?.resource = Some(resource);
        Ok(())
    }

    /// Check that the host may write `len` bytes into `id`.
    pub fn check_upload(&self, id: BufferId, len: usize) -> Result<&BufferSpec> {
        let spec = self.spec(id)?;
        if !spec.kind.host_writable() {
            return Err(SegmentError::Transfer {
                label: spec.label.to_string(),
                reason: format!("{:?} buffers are not host-writable", spec.kind),
            });
        }
        if len as u64 != spec.size {
            return Err(SegmentError::Transfer {
                label: spec.label.to_string(),
                reason: format!("upload of {len} bytes into a {}-byte buffer", spec.size),
            });
        }
        Ok(spec)
    }

    /// Check that the host may read `id` back.
    pub fn check_download(&self, id: BufferId) -> Result<&BufferSpec> {
        let spec = self.spec(id)?;
        if !spec.kind.host_readable() {
            return Err(SegmentError::Transfer {
                label: spec.label.to_string(),
                reason: format!("{:?} buffers are not host-readable", spec.kind),
            });
        }
        Ok(spec)
    }

    /// Release one buffer. Unknown ids are ignored.
    pub fn remove(&mut self, id: BufferId) -> Option<B> {
        let pos = self.entries.iter().position(|e| e.id == id)?;
        self.entries.remove(pos).resource
    }

    /// Live buffer ids, oldest first.
    pub fn ids(&self) -> impl Iterator<Item = BufferId> + '_ {
        self.entries.iter().map(|e| e.id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total bytes currently allocated.
    pub fn total_bytes(&self) -> u64 {
        self.entries.iter().map(|e| e.spec.size).sum()
    }
}

impl<B> Drop for BufferSet<B> {
    fn drop(&mut self) {
        while let Some(entry) = self.entries.pop() {
            drop(entry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct Tracked {
        name: &'static str,
        log: Rc<RefCell<Vec<&'static str>>>,
    }

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.log.borrow_mut().push(self.name);
        }
    }

    #[test]
    fn test_drop_releases_in_reverse_creation_order() {
        let log = Rc::new(RefCell::new(Vec::new()));
        {
            let mut set = BufferSet::new();
            for name in ["input", "grad_x", "grad_y", "output"] {
                set.insert(
                    BufferSpec::new(name, BufferKind::Scratch, 16),
                    Tracked { name, log: Rc::clone(&log) },
                );
            }
        }
        assert_eq!(*log.borrow(), vec!["output", "grad_y", "grad_x", "input"]);
    }

    #[test]
    fn test_upload_rules() {
        let mut set = BufferSet::new();
        let input = set.insert(BufferSpec::new("input", BufferKind::Input, 16), ());
        let output = set.insert(BufferSpec::new("output", BufferKind::Output, 16), ());

        assert!(set.check_upload(input, 16).is_ok());
        assert!(matches!(
            set.check_upload(input, 12),
            Err(SegmentError::Transfer { .. })
        ));
        assert!(matches!(
            set.check_upload(output, 16),
            Err(SegmentError::Transfer { .. })
        ));
        assert!(set.check_download(output).is_ok());
        assert!(set.check_download(input).is_err());
    }

    #[test]
    fn test_take_and_restore() {
        let mut set = BufferSet::new();
        let id = set.insert(BufferSpec::new("labels", BufferKind::Scratch, 8), vec![1u32, 2]);
        let mut words = set.take(id).unwrap();
        assert!(set.get(id).is_err());
        words[0] = 7;
        set.restore(id, words).unwrap();
        assert_eq!(set.get(id).unwrap(), &vec![7, 2]);
    }

    #[test]
    fn test_remove_unknown_is_ignored() {
        let mut set: BufferSet<()> = BufferSet::new();
        assert!(set.remove(BufferId(42)).is_none());
        let id = set.insert(BufferSpec::new("a", BufferKind::Table, 4), ());
        assert_eq!(set.total_bytes(), 4);
        assert!(set.remove(id).is_some());
        assert!(set.is_empty());
    }
}
