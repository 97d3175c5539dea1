//! Red-black sibling trees over the directory arena.
//!
//! Each storage keeps its children in a binary search tree whose links are
//! the `left`/`right` SIDs persisted in the directory records themselves;
//! the parent record's `child` SID names the tree root. This module
//! implements the balancing operations directly against the arena
//! (`&mut [DirectoryEntry]`), so the in-memory tree is byte-identical to
//! what lands on disk.
//!
//! The balancing scheme is the left-leaning variant: red links lean left,
//! the root is black, no red node has a red child, and every root-to-leaf
//! path crosses the same number of black nodes. Parent pointers are never
//! stored; recursion carries them, which keeps the persisted records free
//! of transient state.
//!
//! Deletion splices the in-order successor into the removed node's
//! position by swapping record payloads, so the *slot* returned to the
//! caller (to be marked Invalid and recycled) may differ from the SID the
//! removed name originally occupied.

use crate::consts::NOSTREAM;
use crate::directory::{DirectoryEntry, EntryType, NodeColor, cmp_names};
use crate::error::{Error, Result};
use fixedbitset::FixedBitSet;
use smallvec::SmallVec;
use std::cmp::Ordering;

fn left_of(dir: &[DirectoryEntry], sid: u32) -> u32 {
    if sid == NOSTREAM {
        NOSTREAM
    } else {
        dir[sid as usize].left
    }
}

fn right_of(dir: &[DirectoryEntry], sid: u32) -> u32 {
    if sid == NOSTREAM {
        NOSTREAM
    } else {
        dir[sid as usize].right
    }
}

fn is_red(dir: &[DirectoryEntry], sid: u32) -> bool {
    sid != NOSTREAM && dir[sid as usize].color == NodeColor::Red
}

fn flip_one(dir: &mut [DirectoryEntry], sid: u32) {
    if sid != NOSTREAM {
        let entry = &mut dir[sid as usize];
        entry.color = match entry.color {
            NodeColor::Red => NodeColor::Black,
            NodeColor::Black => NodeColor::Red,
        };
    }
}

fn flip_colors(dir: &mut [DirectoryEntry], h: u32) {
    flip_one(dir, h);
    flip_one(dir, left_of(dir, h));
    flip_one(dir, right_of(dir, h));
}

fn rotate_left(dir: &mut [DirectoryEntry], h: u32) -> u32 {
    let x = right_of(dir, h);
    debug_assert!(x != NOSTREAM);
    dir[h as usize].right = left_of(dir, x);
    dir[x as usize].left = h;
    dir[x as usize].color = dir[h as usize].color;
    dir[h as usize].color = NodeColor::Red;
    x
}

fn rotate_right(dir: &mut [DirectoryEntry], h: u32) -> u32 {
    let x = left_of(dir, h);
    debug_assert!(x != NOSTREAM);
    dir[h as usize].left = right_of(dir, x);
    dir[x as usize].right = h;
    dir[x as usize].color = dir[h as usize].color;
    dir[h as usize].color = NodeColor::Red;
    x
}

fn fixup(dir: &mut [DirectoryEntry], mut h: u32) -> u32 {
    if is_red(dir, right_of(dir, h)) && !is_red(dir, left_of(dir, h)) {
        h = rotate_left(dir, h);
    }
    if is_red(dir, left_of(dir, h)) && is_red(dir, left_of(dir, left_of(dir, h))) {
        h = rotate_right(dir, h);
    }
    if is_red(dir, left_of(dir, h)) && is_red(dir, right_of(dir, h)) {
        flip_colors(dir, h);
    }
    h
}

fn move_red_left(dir: &mut [DirectoryEntry], mut h: u32) -> u32 {
    flip_colors(dir, h);
    if is_red(dir, left_of(dir, right_of(dir, h))) {
        let rotated = rotate_right(dir, right_of(dir, h));
        dir[h as usize].right = rotated;
        h = rotate_left(dir, h);
        flip_colors(dir, h);
    }
    h
}

fn move_red_right(dir: &mut [DirectoryEntry], mut h: u32) -> u32 {
    flip_colors(dir, h);
    if is_red(dir, left_of(dir, left_of(dir, h))) {
        h = rotate_right(dir, h);
        flip_colors(dir, h);
    }
    h
}

/// Insert the entry at `sid` into the tree rooted at `root`, returning the
/// new root. The entry must already live in the arena with its final name.
///
/// Fails with [`Error::DuplicatedItem`] when a sibling with an equal name
/// (under the invariant ordering) already exists; the tree is unchanged in
/// that case.
pub fn insert(dir: &mut [DirectoryEntry], root: u32, sid: u32) -> Result<u32> {
    let new_root = insert_rec(dir, root, sid)?;
    dir[new_root as usize].color = NodeColor::Black;
    Ok(new_root)
}

fn insert_rec(dir: &mut [DirectoryEntry], h: u32, sid: u32) -> Result<u32> {
    if h == NOSTREAM {
        let entry = &mut dir[sid as usize];
        entry.left = NOSTREAM;
        entry.right = NOSTREAM;
        entry.color = NodeColor::Red;
        return Ok(sid);
    }
    match cmp_names(&dir[sid as usize].name, &dir[h as usize].name) {
        Ordering::Equal => {
            return Err(Error::DuplicatedItem(dir[sid as usize].name.clone()));
        }
        Ordering::Less => {
            let new_left = insert_rec(dir, left_of(dir, h), sid)?;
            dir[h as usize].left = new_left;
        }
        Ordering::Greater => {
            let new_right = insert_rec(dir, right_of(dir, h), sid)?;
            dir[h as usize].right = new_right;
        }
    }
    Ok(fixup(dir, h))
}

/// Look up a child by name with a plain BST descent.
pub fn find(dir: &[DirectoryEntry], root: u32, name: &str) -> Option<u32> {
    let mut current = root;
    let mut steps = 0usize;
    while current != NOSTREAM && steps <= dir.len() {
        match cmp_names(name, &dir[current as usize].name) {
            Ordering::Equal => return Some(current),
            Ordering::Less => current = left_of(dir, current),
            Ordering::Greater => current = right_of(dir, current),
        }
        steps += 1;
    }
    None
}

/// Remove the child named `name` from the tree rooted at `root`.
///
/// Returns `(new_root, freed_slot)`. After the call the removed name's
/// payload sits in `freed_slot`, detached from the tree; the caller marks
/// that record Invalid (delete) or renames and re-inserts it (rename).
pub fn remove(dir: &mut [DirectoryEntry], root: u32, name: &str) -> Result<(u32, u32)> {
    if find(dir, root, name).is_none() {
        return Err(Error::NotFound(name.to_string()));
    }
    let mut root = root;
    if !is_red(dir, left_of(dir, root)) && !is_red(dir, right_of(dir, root)) {
        dir[root as usize].color = NodeColor::Red;
    }
    let (new_root, freed) = remove_rec(dir, root, name);
    if new_root != NOSTREAM {
        dir[new_root as usize].color = NodeColor::Black;
    }
    Ok((new_root, freed))
}

fn remove_rec(dir: &mut [DirectoryEntry], mut h: u32, name: &str) -> (u32, u32) {
    if cmp_names(name, &dir[h as usize].name) == Ordering::Less {
        if !is_red(dir, left_of(dir, h)) && !is_red(dir, left_of(dir, left_of(dir, h))) {
            h = move_red_left(dir, h);
        }
        let (new_left, freed) = remove_rec(dir, left_of(dir, h), name);
        dir[h as usize].left = new_left;
        (fixup(dir, h), freed)
    } else {
        if is_red(dir, left_of(dir, h)) {
            h = rotate_right(dir, h);
        }
        if cmp_names(name, &dir[h as usize].name) == Ordering::Equal
            && right_of(dir, h) == NOSTREAM
        {
            return (NOSTREAM, h);
        }
        if !is_red(dir, right_of(dir, h)) && !is_red(dir, left_of(dir, right_of(dir, h))) {
            h = move_red_right(dir, h);
        }
        if cmp_names(name, &dir[h as usize].name) == Ordering::Equal {
            // Splice the in-order successor into this position; its old
            // slot walks away with the removed payload.
            let (new_right, successor) = delete_min(dir, right_of(dir, h));
            swap_payload(dir, h, successor);
            dir[h as usize].right = new_right;
            (fixup(dir, h), successor)
        } else {
            let (new_right, freed) = remove_rec(dir, right_of(dir, h), name);
            dir[h as usize].right = new_right;
            (fixup(dir, h), freed)
        }
    }
}

fn delete_min(dir: &mut [DirectoryEntry], mut h: u32) -> (u32, u32) {
    if left_of(dir, h) == NOSTREAM {
        return (NOSTREAM, h);
    }
    if !is_red(dir, left_of(dir, h)) && !is_red(dir, left_of(dir, left_of(dir, h))) {
        h = move_red_left(dir, h);
    }
    let (new_left, min) = delete_min(dir, left_of(dir, h));
    dir[h as usize].left = new_left;
    (fixup(dir, h), min)
}

/// Swap everything that belongs to the named entity (payload and child
/// tree) between two slots, leaving the positional state (sibling links
/// and color) in place.
fn swap_payload(dir: &mut [DirectoryEntry], a: u32, b: u32) {
    if a == b {
        return;
    }
    let (a, b) = (a as usize, b as usize);
    let (low, high) = if a < b { (a, b) } else { (b, a) };
    let (head, tail) = dir.split_at_mut(high);
    let first = &mut head[low];
    let second = &mut tail[0];
    std::mem::swap(&mut first.name, &mut second.name);
    std::mem::swap(&mut first.entry_type, &mut second.entry_type);
    std::mem::swap(&mut first.child, &mut second.child);
    std::mem::swap(&mut first.clsid, &mut second.clsid);
    std::mem::swap(&mut first.state_bits, &mut second.state_bits);
    std::mem::swap(&mut first.created, &mut second.created);
    std::mem::swap(&mut first.modified, &mut second.modified);
    std::mem::swap(&mut first.start_sector, &mut second.start_sector);
    std::mem::swap(&mut first.size, &mut second.size);
}

/// In-order traversal of a tree built by this module.
pub fn in_order(dir: &[DirectoryEntry], root: u32) -> Vec<u32> {
    let mut out = Vec::new();
    let mut stack: SmallVec<[u32; 32]> = SmallVec::new();
    let mut current = root;
    while current != NOSTREAM || !stack.is_empty() {
        while current != NOSTREAM {
            stack.push(current);
            current = left_of(dir, current);
        }
        let sid = stack.pop().unwrap();
        out.push(sid);
        current = right_of(dir, sid);
    }
    out
}

/// Collect every SID reachable through the raw on-disk sibling links of
/// `child_root`, in DFS order, without trusting the links.
///
/// With `strict` set, an out-of-range SID, a link to an Invalid record, or
/// a revisited SID (a sibling cycle) is [`Error::CorruptedFile`]; in
/// lenient mode the offending link is skipped and traversal continues with
/// whatever remains reachable. Either way the visited set bounds the walk,
/// so hostile link graphs cannot loop forever.
pub fn collect_siblings(dir: &[DirectoryEntry], child_root: u32, strict: bool) -> Result<Vec<u32>> {
    let mut out = Vec::new();
    if child_root == NOSTREAM {
        return Ok(out);
    }
    let mut visited = FixedBitSet::with_capacity(dir.len());
    let mut stack: SmallVec<[u32; 32]> = SmallVec::new();
    stack.push(child_root);
    while let Some(sid) = stack.pop() {
        if sid == NOSTREAM {
            continue;
        }
        let index = sid as usize;
        if index >= dir.len() {
            if strict {
                return Err(Error::corrupted(format!(
                    "sibling SID {} is out of range",
                    sid
                )));
            }
            continue;
        }
        if visited.contains(index) {
            if strict {
                return Err(Error::corrupted(format!(
                    "cyclic sibling reference at SID {}",
                    sid
                )));
            }
            continue;
        }
        visited.insert(index);
        let entry = &dir[index];
        if entry.entry_type == EntryType::Invalid {
            if strict {
                return Err(Error::corrupted(format!(
                    "sibling SID {} references an unallocated entry",
                    sid
                )));
            }
            continue;
        }
        out.push(sid);
        stack.push(entry.right);
        stack.push(entry.left);
    }
    Ok(out)
}

/// Check the red-black invariants and the search order of a tree. Used by
/// tests and debug assertions.
pub fn validate(dir: &[DirectoryEntry], root: u32) -> std::result::Result<(), String> {
    if is_red(dir, root) {
        return Err("root is red".to_string());
    }
    check_subtree(dir, root).map(|_| ())
}

fn check_subtree(dir: &[DirectoryEntry], sid: u32) -> std::result::Result<usize, String> {
    if sid == NOSTREAM {
        return Ok(1);
    }
    let left = left_of(dir, sid);
    let right = right_of(dir, sid);
    if is_red(dir, sid) && (is_red(dir, left) || is_red(dir, right)) {
        return Err(format!("red node {} has a red child", sid));
    }
    if left != NOSTREAM
        && cmp_names(&dir[left as usize].name, &dir[sid as usize].name) != Ordering::Less
    {
        return Err(format!("order violation left of {}", sid));
    }
    if right != NOSTREAM
        && cmp_names(&dir[right as usize].name, &dir[sid as usize].name) != Ordering::Greater
    {
        return Err(format!("order violation right of {}", sid));
    }
    let left_height = check_subtree(dir, left)?;
    let right_height = check_subtree(dir, right)?;
    if left_height != right_height {
        return Err(format!(
            "black height mismatch at {}: {} vs {}",
            sid, left_height, right_height
        ));
    }
    Ok(left_height + if is_red(dir, sid) { 0 } else { 1 })
}
