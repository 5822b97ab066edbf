//! Response payloads, one per task. Field names are part of the HTTP contract.

use serde::{Deserialize, Serialize};

use crate::labels::Gender;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmotionPrediction {
    pub predicted_mood: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenderPrediction {
    pub gender: Gender,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenrePrediction {
    pub genre: String,
    /// Best three genres with their aggregated scores, best first.
    /// Serialised as `[["Rock", 0.41], ...]`.
    pub top_genres: Vec<(String, f32)>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentPrediction {
    /// Comma-joined, best first: `"Piano, Violin, ..."`.
    pub top_instruments: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn genre_pairs_serialize_as_arrays() {
        let p = GenrePrediction {
            genre: "Rock".into(),
            top_genres: vec![("Rock".into(), 0.5), ("Pop".into(), 0.25)],
        };
        let json = serde_json::to_value(&p).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"genre": "Rock", "top_genres": [["Rock", 0.5], ["Pop", 0.25]]})
        );
    }

    #[test]
    fn gender_payload_shape() {
        let json = serde_json::to_string(&GenderPrediction {
            gender: Gender::Female,
        })
        .unwrap();
        assert_eq!(json, r#"{"gender":"Female"}"#);
    }
}
