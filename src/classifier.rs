use crate::models::domain::{Address, FlowKey, Mode, Observation};

/// Derives the bucket key for an observation.
///
/// Total over every observation: a missing address becomes [`Address::Unknown`]
/// and a missing transport becomes the mode's protocol sentinel, so bytes are
/// never dropped for keying reasons.
pub fn classify(obs: &Observation, mode: Mode) -> FlowKey {
    FlowKey {
        source: Address::from(obs.source),
        destination: Address::from(obs.destination),
        protocol: obs
            .transport
            .map_or(mode.protocol_sentinel(), |t| t.as_str())
            .to_string(),
    }
}
