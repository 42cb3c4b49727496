use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use tubes_proto::messages::Participant;

/// The maximum length of a bus name, in bytes.
pub const MAX_BUS_NAME_LENGTH: usize = 255;

const BUS_NAME_PREFIX: &str = ":2.";

/// Derives the unique bus name a participant uses on group bus tubes.
///
/// The name is the same for every tube, so peers can compute each other's names without
/// asking. Only ASCII is produced, so truncation always lands on a character boundary.
pub fn bus_name_for(participant: &Participant) -> String {
    let mut name = String::with_capacity(BUS_NAME_PREFIX.len() + participant.as_str().len() * 4 / 3 + 1);
    name.push_str(BUS_NAME_PREFIX);
    URL_SAFE_NO_PAD.encode_string(participant.as_str(), &mut name);
    name.truncate(MAX_BUS_NAME_LENGTH);
    name
}

#[cfg(test)]
mod tests {
    use tubes_proto::messages::Participant;

    use super::{bus_name_for, MAX_BUS_NAME_LENGTH};

    #[test]
    fn test_bus_name() {
        assert_eq!(bus_name_for(&Participant::new("bob")), ":2.Ym9i");
        assert_ne!(bus_name_for(&Participant::new("alice")), bus_name_for(&Participant::new("alicf")));
    }

    #[test]
    fn test_long_handle_is_truncated() {
        let handle = "x".repeat(1000);
        assert_eq!(bus_name_for(&Participant::new(handle)).len(), MAX_BUS_NAME_LENGTH);
    }
}
