//! Class label tables. Index `i` of a model's score vector is `TABLE[i]`.

use serde::{Deserialize, Serialize};

pub const MOODS: [&str; 4] = ["Angry", "Happy", "Relaxed", "Sad"];

pub const GENRES: [&str; 10] = [
    "Blues",
    "Classical",
    "Country",
    "Disco",
    "Hiphop",
    "Jazz",
    "Metal",
    "Pop",
    "Reggae",
    "Rock",
];

pub const INSTRUMENTS: [&str; 28] = [
    "Accordion",
    "Acoustic Guitar",
    "Banjo",
    "Bass Guitar",
    "Clarinet",
    "Cowbell",
    "Cymbals",
    "Dobro",
    "Drum Set",
    "Electric Guitar",
    "Floor Tom",
    "Flute",
    "Harmonica",
    "Harmonium",
    "Hi Hats",
    "Horn",
    "Keyboard",
    "Mandolin",
    "Organ",
    "Piano",
    "Saxophone",
    "Shakers",
    "Tambourine",
    "Trombone",
    "Trumpet",
    "Ukulele",
    "Vibraphone",
    "Violin",
];

/// Returned when a voted class index falls outside [`MOODS`].
pub const UNKNOWN_MOOD: &str = "Unknown";

pub fn mood_label(index: Option<usize>) -> &'static str {
    index
        .and_then(|i| MOODS.get(i).copied())
        .unwrap_or(UNKNOWN_MOOD)
}

/// Vocalist gender. The gender model emits class 1 for female and anything
/// else for male.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Gender {
    Male,
    Female,
}

impl Gender {
    pub fn from_class(class: usize) -> Self {
        if class == 1 {
            Gender::Female
        } else {
            Gender::Male
        }
    }
}
