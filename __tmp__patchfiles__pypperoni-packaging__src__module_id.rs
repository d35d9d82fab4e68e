// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Stable 32-bit module id allocation. */

use byteorder::{ByteOrder, LittleEndian};
use sha1::{Digest, Sha1};

/// Compute the stable id for a non-main module: the first 4 bytes of
/// `SHA1(name)`, read as a little-endian u32. The main module always uses
/// id 0 regardless of its name (see `module_graph::ModuleGraph`).
pub fn module_id(name: &str) -> u32 {
    let digest = Sha1::digest(name.as_bytes());
    LittleEndian::read_u32(&digest[0..4])
}

pub const MAIN_MODULE_ID: u32 = 0;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_depends_only_on_name() {
        assert_eq!(module_id("os"), module_id("os"));
        assert_ne!(module_id("os"), module_id("sys"));
    }

    #[test]
    fn test_matches_direct_computation() {
        let digest = Sha1::digest(b"encodings");
        let expected = LittleEndian::read_u32(&digest[0..4]);
        assert_eq!(module_id("encodings"), expected);
    }
}


