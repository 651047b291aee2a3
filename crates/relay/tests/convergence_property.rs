use std::collections::HashSet;

use proptest::prelude::*;
use tandem_common::protocol::frame;
use tandem_relay::connection::ConnectionId;
use tandem_relay::sync::SharedDoc;
use tandem_relay::ws::sync::handle_sync_frame;
use yrs::{Doc, GetString, ReadTxn, StateVector, Text, Transact};

const TEXT_KEY: &str = "content";

#[derive(Debug, Clone)]
struct Lcg {
    state: u64,
}

impl Lcg {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        self.state = self.state.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
        self.state
    }

    fn next_usize(&mut self, upper_exclusive: usize) -> usize {
        if upper_exclusive == 0 {
            return 0;
        }
        (self.next_u64() as usize) % upper_exclusive
    }
}

/// Makes every edit on its own client document and returns each edit's
/// incremental update, tagged with the sending connection.
fn client_updates(clients: &[Vec<(u8, String)>]) -> Vec<(ConnectionId, Vec<u8>)> {
    let mut updates = Vec::new();
    for (index, edits) in clients.iter().enumerate() {
        let doc = Doc::with_client_id(index as u64 + 1);
        let text = doc.get_or_insert_text(TEXT_KEY);
        for (position, content) in edits {
            let mut txn = doc.transact_mut();
            let len = text.len(&txn);
            text.insert(&mut txn, u32::from(*position) % (len + 1), content);
            updates.push((ConnectionId(index as u64 + 1), txn.encode_update_v1()));
        }
    }
    updates
}

fn shuffle<T>(items: &mut [T], rng: &mut Lcg) {
    for index in (1..items.len()).rev() {
        let other = rng.next_usize(index + 1);
        items.swap(index, other);
    }
}

async fn relay_all(doc: &SharedDoc, updates: &[(ConnectionId, Vec<u8>)]) {
    let mut controlled = HashSet::new();
    for (id, update) in updates {
        let payload = frame::update(update.clone());
        handle_sync_frame(doc, *id, &mut controlled, &payload).await.expect("update should apply");
    }
}

async fn snapshot(doc: &SharedDoc) -> (String, StateVector) {
    let state = doc.lock().await;
    let text = state.doc().get_or_insert_text(TEXT_KEY);
    let txn = state.doc().transact();
    (text.get_string(&txn), txn.state_vector())
}

fn edit_strategy() -> impl Strategy<Value = Vec<Vec<(u8, String)>>> {
    prop::collection::vec(prop::collection::vec((any::<u8>(), "[a-z]{1,6}"), 1..=4), 2..=3)
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        .. ProptestConfig::default()
    })]

    #[test]
    fn relayed_documents_converge_regardless_of_arrival_order(
        clients in edit_strategy(),
        seed in any::<u64>(),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .expect("runtime should build");

        let in_order = client_updates(&clients);
        let mut shuffled = in_order.clone();
        shuffle(&mut shuffled, &mut Lcg::new(seed));

        let (ordered, reordered) = runtime.block_on(async {
            let a = SharedDoc::new("a", true);
            let b = SharedDoc::new("b", true);
            relay_all(&a, &in_order).await;
            relay_all(&b, &shuffled).await;
            (snapshot(&a).await, snapshot(&b).await)
        });

        prop_assert_eq!(&ordered.0, &reordered.0);
        prop_assert_eq!(&ordered.1, &reordered.1);

        let total: usize = clients.iter().flatten().map(|(_, content)| content.len()).sum();
        prop_assert_eq!(ordered.0.len(), total);
    }
}
