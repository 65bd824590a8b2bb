/// Global transaction identifier.
///
/// GXIDs are sequential 32-bit values that wrap around. Two GXIDs are ordered
/// by the signed difference between them ("follows/precedes"), never by a
/// direct `<` comparison, which would be wrong after a wrap. Values below
/// `FIRST_NORMAL_GXID` are reserved and never handed out.
pub type Gxid = u32;

/// Marks "no GXID assigned".
pub const INVALID_GXID: Gxid = 0;

/// Reserved identifier for bootstrap data.
pub const BOOTSTRAP_GXID: Gxid = 1;

/// Reserved identifier for frozen (permanently visible) data.
pub const FROZEN_GXID: Gxid = 2;

/// First identifier the generator may assign.
pub const FIRST_NORMAL_GXID: Gxid = 3;

#[must_use]
pub const fn is_valid(gxid: Gxid) -> bool {
    gxid != INVALID_GXID
}

#[must_use]
pub const fn is_normal(gxid: Gxid) -> bool {
    gxid >= FIRST_NORMAL_GXID
}

/// True when `a` was assigned after `b`, modulo the 32-bit wrap.
#[must_use]
pub const fn follows(a: Gxid, b: Gxid) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

#[must_use]
pub const fn follows_or_equals(a: Gxid, b: Gxid) -> bool {
    (a.wrapping_sub(b) as i32) >= 0
}

/// True when `a` was assigned before `b`, modulo the 32-bit wrap.
#[must_use]
pub const fn precedes(a: Gxid, b: Gxid) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

#[must_use]
pub const fn precedes_or_equals(a: Gxid, b: Gxid) -> bool {
    (a.wrapping_sub(b) as i32) <= 0
}

/// Advance a GXID by one, skipping the reserved low range on wrap.
#[must_use]
pub const fn advance(gxid: Gxid) -> Gxid {
    let next = gxid.wrapping_add(1);
    if next < FIRST_NORMAL_GXID {
        FIRST_NORMAL_GXID
    } else {
        next
    }
}

/// The later of two GXIDs under modular ordering.
#[must_use]
pub const fn later(a: Gxid, b: Gxid) -> Gxid {
    if follows(a, b) { a } else { b }
}

/// The earlier of two GXIDs under modular ordering.
#[must_use]
pub const fn earlier(a: Gxid, b: Gxid) -> Gxid {
    if precedes(a, b) { a } else { b }
}
