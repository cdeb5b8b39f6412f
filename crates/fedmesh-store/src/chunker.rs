// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Line-oriented CSV chunker.
//!
//! The splitter never breaks inside a line, and the header line is read once
//! and prepended to every chunk, so each chunk a trainer downloads is a
//! valid standalone CSV with the original schema.

use crate::error::StoreError;

/// Split CSV text into chunks of at most roughly `budget` bytes.
///
/// Every chunk starts with the header line.  A single data row larger than
/// the budget still travels whole, in its own chunk.  A file with a header
/// and no data rows yields one header-only chunk.
pub fn chunk_csv(data: &str, budget: usize) -> Result<Vec<String>, StoreError> {
    let mut lines = data.lines();
    let header = lines
        .next()
        .filter(|h| !h.trim().is_empty())
        .ok_or_else(|| StoreError::Dataset("dataset has no header line".into()))?;

    let mut chunks = Vec::new();
    let mut current = String::new();

    for line in lines {
        if line.is_empty() {
            continue;
        }
        let grown = current.len() + header.len() + 1 + line.len() + 1;
        if !current.is_empty() && grown > budget {
            chunks.push(finish_chunk(header, &current));
            current.clear();
        }
        current.push_str(line);
        current.push('\n');
    }

    if !current.is_empty() || chunks.is_empty() {
        chunks.push(finish_chunk(header, &current));
    }

    Ok(chunks)
}

fn finish_chunk(header: &str, rows: &str) -> String {
    let mut chunk = String::with_capacity(header.len() + 1 + rows.len());
    chunk.push_str(header);
    chunk.push('\n');
    chunk.push_str(rows);
    chunk
}

#[cfg(test)]
mod tests {
    use super::*;

    fn csv(rows: usize) -> String {
        let mut s = String::from("id,feature,label\n");
        for i in 0..rows {
            s.push_str(&format!("{i},0.5,1\n"));
        }
        s
    }

    #[test]
    fn every_chunk_starts_with_the_header() {
        let data = csv(1000);
        let chunks = chunk_csv(&data, 1024).unwrap();
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.starts_with("id,feature,label\n"));
        }
    }

    #[test]
    fn no_row_is_split_and_none_is_lost() {
        let data = csv(500);
        let chunks = chunk_csv(&data, 256).unwrap();

        let mut rows = Vec::new();
        for chunk in &chunks {
            for line in chunk.lines().skip(1) {
                rows.push(line.to_string());
            }
        }
        let expected: Vec<String> = data.lines().skip(1).map(String::from).collect();
        assert_eq!(rows, expected, "chunking must preserve every row in order");
    }

    #[test]
    fn chunks_respect_the_budget() {
        let chunks = chunk_csv(&csv(1000), 2048).unwrap();
        for chunk in &chunks {
            assert!(chunk.len() <= 2048, "chunk of {} bytes over budget", chunk.len());
        }
    }

    #[test]
    fn oversized_single_row_travels_whole() {
        let big_row = "x".repeat(4096);
        let data = format!("col\n{big_row}\nshort\n");
        let chunks = chunk_csv(&data, 100).unwrap();
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].contains(&big_row));
        assert!(chunks[1].contains("short"));
    }

    #[test]
    fn header_only_file_yields_one_chunk() {
        let chunks = chunk_csv("a,b,c\n", 1024).unwrap();
        assert_eq!(chunks, vec!["a,b,c\n".to_string()]);
    }

    #[test]
    fn empty_input_is_rejected() {
        assert!(chunk_csv("", 1024).is_err());
        assert!(chunk_csv("\n\n", 1024).is_err());
    }
}
