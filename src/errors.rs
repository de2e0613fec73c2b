/*
 * Copyright (c) 2022 Shi Lei
 *
 * Use of this source code is governed by a MIT-style license
 * that can be found in the LICENSE file or
 * at https://opensource.org/licenses/MIT
 */

//! Error values returned across the kernel's public surface.
//!
//! The variant set mirrors the failure kinds named by the cache, page-pool
//! and scheduler designs: resource exhaustion after a flush retry, access
//! violations on a directional stream, backing-store I/O failure, thread
//! cancellation observed at a suspension point, and lock-ordering deadlock
//! detection.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrNO {
    /* Indicates an operation was successful. */
    _OK,

    NotFound,
    NotSupported,
    NoResources,
    AlreadyExists,

    InvalidArgs,

    NoMem,

    BadAlign,
    OutOfRange,

    LackBuf,

    /* The operation failed because the current state of the object
     * does not allow it, or a precondition of the operation
     * is not satisfied. */
    BadState,

    BadRange,

    /* Write attempted on an InputStream, or read on an OutputStream. */
    AccessDenied,

    /* The backing store reported a failure servicing a read or write. */
    Io,

    /* The calling thread observed its own cancellation at a suspension point. */
    Cancelled,

    /* A lock-ordering violation was detected before it could deadlock. */
    Deadlock,
}

pub type KResult<T> = Result<T, ErrNO>;
