//! Connection ID allocation.
//!
//! A CID is the session's position in the coordinator's list plus one. Sessions
//! are never removed, so the next CID is always `session_count + 1` and a CID is
//! never handed out twice.

use mavc_types::Cid;

/// CID for the session about to be appended to a list of `session_count`.
pub fn next_cid(session_count: usize) -> Cid {
    session_count as Cid + 1
}

/// List index of the session owning `cid`, if `cid` is in range.
pub fn session_index(cid: Cid, session_count: usize) -> Option<usize> {
    let idx = (cid as usize).checked_sub(1)?;
    (idx < session_count).then_some(idx)
}
