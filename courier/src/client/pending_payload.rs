use std::collections::BTreeMap;
use std::ops::Bound;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use courier_protocol::error::CourierError;
use courier_protocol::event::{Event, EventSerializer};
use courier_protocol::jdat::encode_jdat_body;
use courier_protocol::nonce::Nonce;
use courier_protocol::safe_converter::{PrecheckedCast, SafeCast};

/// A batch of events sent as one JDAT payload and kept until the server acknowledged all of them.
///
/// `last_sequence` and `sequence_len` count events of the payload as it was first sent. After a
///  partial acknowledgement the payload is regenerated from the remaining events only, and the
///  server numbers its acknowledgements relative to that shorter transmission. `base_sequence`
///  is the offset between the two.
#[derive(Debug)]
pub struct PendingPayload {
    nonce: Nonce,
    events: Vec<Event>,
    last_sequence: u32,
    sequence_len: u32,
    base_sequence: u32,
    payload: Option<Bytes>,
}

impl PendingPayload {
    /// Spool sizes are validated to fit into u32, so `events.len()` does as well
    pub fn new(events: Vec<Event>, nonce: Nonce, serializer: &dyn EventSerializer) -> Result<PendingPayload, CourierError> {
        if events.is_empty() {
            return Err(CourierError::Serialization("a payload requires at least one event".to_string()));
        }
        let sequence_len = events.len().prechecked_cast();
        let mut result = PendingPayload {
            nonce,
            events,
            last_sequence: 0,
            sequence_len,
            base_sequence: 0,
            payload: None,
        };
        result.generate(serializer)?;
        Ok(result)
    }

    pub fn nonce(&self) -> Nonce {
        self.nonce
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn last_sequence(&self) -> u32 {
        self.last_sequence
    }

    pub fn sequence_len(&self) -> u32 {
        self.sequence_len
    }

    /// The JDAT body for the events that are still unacknowledged. It is built lazily after a
    ///  partial acknowledgement discarded the previous one.
    pub fn generate(&mut self, serializer: &dyn EventSerializer) -> Result<Bytes, CourierError> {
        if let Some(payload) = &self.payload {
            return Ok(payload.clone());
        }
        let payload = encode_jdat_body(&self.nonce, &self.events, serializer)?;
        self.base_sequence = self.last_sequence;
        self.payload = Some(payload.clone());
        Ok(payload)
    }

    /// Applies an acknowledgement, returning the number of newly acknowledged events and whether
    ///  the payload is now complete. `sequence` is relative to the most recent transmission.
    pub fn ack(&mut self, sequence: u32) -> (u32, bool) {
        let sequence = self.base_sequence.saturating_add(sequence);
        if sequence <= self.last_sequence {
            return (0, false);
        }

        if sequence >= self.sequence_len {
            let lines = self.sequence_len - self.last_sequence;
            self.last_sequence = self.sequence_len;
            self.events.clear();
            self.payload = None;
            return (lines, true);
        }

        let lines = sequence - self.last_sequence;
        self.last_sequence = sequence;
        let trimmed: usize = lines.safe_cast();
        self.events.drain(..trimmed);
        self.payload = None;
        (lines, false)
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum AckOutcome {
    /// no pending payload has this nonce, e.g. a late acknowledgement of a completed payload
    UnknownNonce,
    Partial { lines: u32 },
    Complete { lines: u32 },
}

/// The client's unacknowledged payloads in send order, with lookup by nonce. A retry cursor
///  walks the chain after a reconnect so that payloads are retransmitted oldest first.
#[derive(Debug, Default)]
pub struct PayloadChain {
    payloads: BTreeMap<u64, PendingPayload>,
    by_nonce: FxHashMap<Nonce, u64>,
    next_id: u64,
    retry_cursor: Option<u64>,
}

impl PayloadChain {
    pub fn new() -> PayloadChain {
        PayloadChain::default()
    }

    pub fn len(&self) -> usize {
        self.payloads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payloads.is_empty()
    }

    pub fn contains_nonce(&self, nonce: &Nonce) -> bool {
        self.by_nonce.contains_key(nonce)
    }

    /// the oldest unacknowledged payload
    pub fn first(&self) -> Option<&PendingPayload> {
        self.payloads.values().next()
    }

    pub fn push(&mut self, payload: PendingPayload) {
        let id = self.next_id;
        self.next_id += 1;
        self.by_nonce.insert(payload.nonce, id);
        self.payloads.insert(id, payload);
    }

    /// Starts retransmission from the oldest payload
    pub fn rewind(&mut self) {
        self.retry_cursor = self.payloads.keys().next().copied();
    }

    pub fn is_retrying(&self) -> bool {
        self.retry_cursor.is_some()
    }

    /// The body of the next payload to retransmit, advancing the cursor
    pub fn next_retry(&mut self, serializer: &dyn EventSerializer) -> Result<Option<Bytes>, CourierError> {
        let Some(id) = self.retry_cursor else {
            return Ok(None);
        };
        self.retry_cursor = self.key_after(id);

        match self.payloads.get_mut(&id) {
            Some(payload) => Ok(Some(payload.generate(serializer)?)),
            None => Ok(None),
        }
    }

    fn key_after(&self, id: u64) -> Option<u64> {
        self.payloads.range((Bound::Excluded(id), Bound::Unbounded))
            .next()
            .map(|(k, _)| *k)
    }

    pub fn ack(&mut self, nonce: &Nonce, sequence: u32) -> AckOutcome {
        let Some(&id) = self.by_nonce.get(nonce) else {
            return AckOutcome::UnknownNonce;
        };
        let Some(payload) = self.payloads.get_mut(&id) else {
            return AckOutcome::UnknownNonce;
        };

        let (lines, complete) = payload.ack(sequence);
        if !complete {
            return AckOutcome::Partial { lines };
        }

        if self.retry_cursor == Some(id) {
            self.retry_cursor = self.key_after(id);
        }
        self.payloads.remove(&id);
        self.by_nonce.remove(nonce);
        AckOutcome::Complete { lines }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_protocol::event::JsonSerializer;
    use courier_protocol::jdat::JdatEvents;
    use rstest::rstest;
    use serde_json::json;

    fn events(n: usize) -> Vec<Event> {
        (0..n)
            .map(|i| {
                let mut event = Event::new();
                event.insert("n".to_string(), json!(i));
                event
            })
            .collect()
    }

    fn decode(body: &Bytes) -> (Nonce, Vec<Event>) {
        let mut buf = body.as_ref();
        let nonce = Nonce::try_deser(&mut buf).unwrap();
        let events = JdatEvents::inflate(buf, &JsonSerializer).unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        (nonce, events)
    }

    fn payload(n: usize) -> PendingPayload {
        PendingPayload::new(events(n), Nonce::new_random(), &JsonSerializer).unwrap()
    }

    #[test]
    fn test_new_empty() {
        assert!(PendingPayload::new(vec![], Nonce::new_random(), &JsonSerializer).is_err());
    }

    #[test]
    fn test_generate() {
        let mut p = payload(3);
        let (nonce, decoded) = decode(&p.generate(&JsonSerializer).unwrap());
        assert_eq!(nonce, p.nonce());
        assert_eq!(decoded, events(3));
        assert_eq!(p.sequence_len(), 3);
        assert_eq!(p.last_sequence(), 0);
    }

    #[rstest]
    #[case::zero(0, (0, false), 0, 10)]
    #[case::partial(4, (4, false), 4, 6)]
    #[case::almost(9, (9, false), 9, 1)]
    #[case::exact(10, (10, true), 10, 0)]
    #[case::beyond(250, (10, true), 10, 0)]
    fn test_ack(#[case] sequence: u32, #[case] expected: (u32, bool), #[case] last_sequence: u32, #[case] remaining: usize) {
        let mut p = payload(10);
        assert_eq!(p.ack(sequence), expected);
        assert_eq!(p.last_sequence(), last_sequence);
        assert_eq!(p.events().len(), remaining);
        assert_eq!(p.sequence_len(), 10);
    }

    #[test]
    fn test_ack_is_idempotent() {
        let mut p = payload(10);
        assert_eq!(p.ack(3), (3, false));
        assert_eq!(p.ack(3), (0, false));
        assert_eq!(p.ack(2), (0, false));
        assert_eq!(p.ack(5), (2, false));
        assert_eq!(p.events(), &events(10)[5..]);
        assert_eq!(p.ack(10), (5, true));
        assert_eq!(p.ack(10), (0, false));
    }

    #[test]
    fn test_regenerate_after_partial_ack() {
        let mut p = payload(10);
        p.ack(4);

        let (nonce, decoded) = decode(&p.generate(&JsonSerializer).unwrap());
        assert_eq!(nonce, p.nonce());
        assert_eq!(decoded, events(10)[4..].to_vec());

        // the server counts the retransmitted six events from one
        assert_eq!(p.ack(2), (2, false));
        assert_eq!(p.last_sequence(), 6);
        assert_eq!(p.ack(6), (4, true));
    }

    #[test]
    fn test_chain_ack() {
        let mut chain = PayloadChain::new();
        let first = payload(2);
        let second = payload(3);
        let (n1, n2) = (first.nonce(), second.nonce());
        chain.push(first);
        chain.push(second);

        assert_eq!(chain.ack(&Nonce::new_random(), 1), AckOutcome::UnknownNonce);
        assert_eq!(chain.ack(&n2, 1), AckOutcome::Partial { lines: 1 });
        assert_eq!(chain.ack(&n1, 2), AckOutcome::Complete { lines: 2 });
        assert_eq!(chain.len(), 1);
        assert_eq!(chain.first().unwrap().nonce(), n2);
        assert!(!chain.contains_nonce(&n1));

        assert_eq!(chain.ack(&n1, 2), AckOutcome::UnknownNonce);
        assert_eq!(chain.ack(&n2, 3), AckOutcome::Complete { lines: 2 });
        assert!(chain.is_empty());
    }

    #[test]
    fn test_retry_in_send_order() {
        let mut chain = PayloadChain::new();
        let nonces = (0..3)
            .map(|_| {
                let p = payload(1);
                let nonce = p.nonce();
                chain.push(p);
                nonce
            })
            .collect::<Vec<_>>();

        assert!(!chain.is_retrying());
        assert_eq!(chain.next_retry(&JsonSerializer).unwrap(), None);

        chain.rewind();
        for nonce in &nonces {
            assert!(chain.is_retrying());
            let body = chain.next_retry(&JsonSerializer).unwrap().unwrap();
            assert_eq!(decode(&body).0, *nonce);
        }
        assert!(!chain.is_retrying());
    }

    #[test]
    fn test_ack_at_retry_cursor_advances_cursor() {
        let mut chain = PayloadChain::new();
        let first = payload(1);
        let second = payload(1);
        let (n1, n2) = (first.nonce(), second.nonce());
        chain.push(first);
        chain.push(second);

        chain.rewind();
        assert_eq!(chain.ack(&n1, 1), AckOutcome::Complete { lines: 1 });
        let body = chain.next_retry(&JsonSerializer).unwrap().unwrap();
        assert_eq!(decode(&body).0, n2);
        assert!(!chain.is_retrying());
    }
}
