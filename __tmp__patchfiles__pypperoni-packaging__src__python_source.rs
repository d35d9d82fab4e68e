// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Utility functions related to reading raw Python source code. */

use {anyhow::Result, once_cell::sync::Lazy};

static RE_CODING: Lazy<regex::bytes::Regex> = Lazy::new(|| {
    regex::bytes::Regex::new(r"^[ \t\f]*#.*?coding[:=][ \t]*([-_.a-zA-Z0-9]+)").unwrap()
});

/// Derive the source encoding from Python source code.
///
/// Default source encoding is UTF-8. Per PEP 263, the first or second line
/// of source can match a regular expression to declare a custom encoding.
pub fn python_source_encoding(source: &[u8]) -> Vec<u8> {
    let lines = source.split(|v| v == &b'\n');

    for (i, line) in lines.enumerate() {
        if i > 1 {
            break;
        }

        if let Some(m) = RE_CODING.find(line) {
            return m.as_bytes().to_vec();
        }
    }

    b"utf-8".to_vec()
}

/// Decode raw Python source bytes to a Rust string using its declared
/// encoding, falling back to UTF-8 if the encoding is unrecognized.
///
/// The import scanner (see `module_graph`) operates on the decoded text
/// since `import` statements must be located by character, not by byte
/// offset, in sources using a multi-byte encoding.
pub fn decode_source(source: &[u8]) -> Result<String> {
    let encoding = python_source_encoding(source);

    let encoder = match encoding_rs::Encoding::for_label(&encoding) {
        Some(encoder) => encoder,
        None => encoding_rs::UTF_8,
    };

    let (text, ..) = encoder.decode(source);

    Ok(text.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_encoding() {
        assert_eq!(python_source_encoding(b"import os\n"), b"utf-8");
    }

    #[test]
    fn test_declared_encoding() {
        let found = python_source_encoding(b"# -*- coding: latin-1 -*-\nimport os\n");
        assert!(found.ends_with(b"latin-1"));
    }

    #[test]
    fn test_decode_source_roundtrip() {
        let decoded = decode_source(b"import os\nx = 1\n").unwrap();
        assert!(decoded.contains("import os"));
    }
}


