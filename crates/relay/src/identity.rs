// Display identities (name + color) handed to connecting users.
//
// Identities are cached per user id so a reconnecting user keeps the same
// name and color. The cache is bounded; once full, the least recently seen
// user is forgotten.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use rand::seq::SliceRandom;
use rand::Rng;

const COLORS: &[&str] = &[
    "#e06c75", "#98c379", "#e5c07b", "#61afef", "#c678dd", "#56b6c2", "#d19a66", "#be5046",
    "#7ec699", "#f08d49", "#cc99cd", "#6796e6",
];

const ADJECTIVES: &[&str] = &[
    "Brave", "Calm", "Clever", "Eager", "Gentle", "Happy", "Jolly", "Keen", "Lively", "Nimble",
    "Proud", "Quiet", "Swift", "Witty", "Bold", "Bright",
];

const ANIMALS: &[&str] = &[
    "Heron", "Lynx", "Otter", "Badger", "Falcon", "Fox", "Koala", "Marten", "Owl", "Panda",
    "Raven", "Seal", "Tiger", "Walrus", "Wolf", "Yak",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub name: String,
    pub color: String,
}

impl Identity {
    fn generate<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let adjective = ADJECTIVES.choose(rng).copied().unwrap_or("Anonymous");
        let animal = ANIMALS.choose(rng).copied().unwrap_or("User");
        let color = COLORS.choose(rng).copied().unwrap_or("#61afef");
        Self { name: format!("{adjective} {animal}"), color: color.to_string() }
    }
}

#[derive(Debug)]
struct CachedIdentity {
    identity: Identity,
    last_seen: u64,
}

/// `by_tick` orders users by when they were last seen, so the least
/// recently seen one is its first entry.
#[derive(Debug, Default)]
struct IdentityCache {
    entries: HashMap<String, CachedIdentity>,
    by_tick: BTreeMap<u64, String>,
    tick: u64,
}

impl IdentityCache {
    fn evict_oldest(&mut self) -> Option<String> {
        let (_, user_id) = self.by_tick.pop_first()?;
        self.entries.remove(&user_id);
        Some(user_id)
    }
}

#[derive(Debug)]
pub struct IdentityAllocator {
    cache: Mutex<IdentityCache>,
    capacity: usize,
}

impl IdentityAllocator {
    pub fn new(capacity: usize) -> Self {
        Self { cache: Mutex::new(IdentityCache::default()), capacity: capacity.max(1) }
    }

    /// Returns the cached identity for `user_id`, generating one on first
    /// sight. Either way the user counts as just seen.
    pub fn identify(&self, user_id: &str) -> Identity {
        let mut guard = match self.cache.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let cache = &mut *guard;
        cache.tick += 1;
        let tick = cache.tick;

        if let Some(cached) = cache.entries.get_mut(user_id) {
            cache.by_tick.remove(&cached.last_seen);
            cache.by_tick.insert(tick, user_id.to_string());
            cached.last_seen = tick;
            return cached.identity.clone();
        }

        let identity = Identity::generate(&mut rand::thread_rng());
        cache
            .entries
            .insert(user_id.to_string(), CachedIdentity { identity: identity.clone(), last_seen: tick });
        cache.by_tick.insert(tick, user_id.to_string());

        while cache.entries.len() > self.capacity {
            match cache.evict_oldest() {
                Some(oldest) => tracing::debug!(user_id = %oldest, "evicting cached identity"),
                None => break,
            }
        }

        identity
    }

    pub fn peek(&self, user_id: &str) -> Option<Identity> {
        let cache = self.cache.lock().ok()?;
        cache.entries.get(user_id).map(|cached| cached.identity.clone())
    }

    pub fn len(&self) -> usize {
        self.cache.lock().map(|cache| cache.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// `user-<unix millis>-<6 alphanumerics>`, used when a client names no user.
pub fn generate_user_id() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(6)
        .map(char::from)
        .collect::<String>()
        .to_ascii_lowercase();
    format!("user-{}-{suffix}", chrono::Utc::now().timestamp_millis())
}
