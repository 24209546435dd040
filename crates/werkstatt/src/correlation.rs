use uuid::Uuid;

/// Source of correlation ids for requests that arrive without one.
///
/// Ids only need to be unique among the requests pending on a single
/// worker; the engine does not check generated ids for collisions.
pub trait CorrelationIds: Send + Sync {
    fn next_id(&self) -> String;
}

/// Random v4 UUIDs.
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidCorrelationIds;

impl CorrelationIds for UuidCorrelationIds {
    fn next_id(&self) -> String {
        Uuid::new_v4().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuid_ids_are_distinct() {
        let ids = UuidCorrelationIds;
        let a = ids.next_id();
        let b = ids.next_id();
        assert_ne!(a, b);
        assert!(Uuid::parse_str(&a).is_ok());
    }
}
