use std::os::unix::io::RawFd;

use mio::Interest;

/// A not-yet-installed poll handle: a file descriptor, the readiness it is
/// interested in, and the callback to run on each readiness edge. Mirrors
/// `epoll_handle_init()` in `examples/original_source/src/epoll_mgr.c` —
/// constructing a handle is separate from installing it into a [`crate::PollSet`].
pub struct Handle {
    pub(crate) raw_fd: RawFd,
    pub(crate) interest: Interest,
    pub(crate) callback: Box<dyn FnMut() + Send>,
    pub(crate) ref_hook: Option<Box<dyn Fn(bool) + Send>>,
}

impl Handle {
    pub fn new(raw_fd: RawFd, interest: Interest, callback: impl FnMut() + Send + 'static) -> Self {
        Handle {
            raw_fd,
            interest,
            callback: Box::new(callback),
            ref_hook: None,
        }
    }

    /// Registers a reference hook, invoked with `true` right before install
    /// and `false` right after removal, so the handle's owner cannot be
    /// freed while the poll loop might still invoke its callback.
    pub fn with_ref_hook(mut self, hook: impl Fn(bool) + Send + 'static) -> Self {
        self.ref_hook = Some(Box::new(hook));
        self
    }
}

/// Opaque identity of an installed [`Handle`]. Indexes into the poll set's
/// internal slab rather than pointing at the handle directly, so there is
/// no raw back-pointer from the reactor into handle owners (see
/// spec.md §9 "Cyclic references").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleId(pub(crate) usize);
