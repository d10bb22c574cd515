// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Human-readable run names of the form `adjective-noun-N`.

use std::collections::HashSet;

const ADJECTIVES: &[&str] = &[
    "dainty", "brave", "calm", "eager", "fancy", "gentle", "happy", "jolly", "kind", "lively",
    "merry", "nice", "proud", "silly", "witty", "bright", "clever", "daring", "fearless",
    "graceful", "honest", "loyal", "patient", "quiet", "swift", "bold", "cosmic", "dusty",
    "frosty", "misty", "rusty", "sunny",
];

const NOUNS: &[&str] = &[
    "sunset", "forest", "river", "mountain", "breeze", "meadow", "ocean", "valley", "sky",
    "field", "cloud", "star", "rain", "leaf", "stone", "flower", "bird", "tree", "wave", "trail",
    "otter", "falcon", "comet", "harbor", "canyon", "glacier", "lantern", "orchard",
];

/// Picks a name not present in `taken`.
///
/// The numeric suffix is one more than the number of names already taken, so
/// names read in creation order; it keeps increasing until the name is free.
pub fn generate_run_name<'a, I>(taken: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let taken: HashSet<&str> = taken.into_iter().collect();
    let adjective = ADJECTIVES[fastrand::usize(..ADJECTIVES.len())];
    let noun = NOUNS[fastrand::usize(..NOUNS.len())];
    let mut number = taken.len() + 1;
    loop {
        let name = format!("{adjective}-{noun}-{number}");
        if !taken.contains(name.as_str()) {
            return name;
        }
        number += 1;
    }
}
