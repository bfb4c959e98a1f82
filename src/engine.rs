//! The protocol engine: value construction, reveal, linear, and product.
//! See spec §4.3.

use crate::barrier;
use crate::config::Config;
use crate::envelope::{self, header};
use crate::error::RtasError;
use crate::party::{AddressMap, Party};
use crate::tensor::Tensor;
use crate::transport::{self, Transport};
use crate::triples::{self, Triple};
use crate::value::{Mode, Value};
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::net::TcpStream;
use std::sync::Mutex;

/// A batch of triples cached under one tag on a compute party, tagged with
/// the shapes/kernel it was generated for so a caller can't accidentally
/// reuse the tag for an incompatible stream (spec §9, "Triple cache keying").
struct TripleBucket<T: Tensor> {
    shape_x: Vec<usize>,
    shape_y: Vec<usize>,
    kernel_id: String,
    queue: VecDeque<Triple<T>>,
}

/// The same bookkeeping on P2, which holds a counter rather than the
/// triples themselves.
struct P2Bucket {
    shape_x: Vec<usize>,
    shape_y: Vec<usize>,
    kernel_id: String,
    remaining: usize,
}

fn check_bucket_key(
    tag: &str,
    shape_x: &[usize],
    shape_y: &[usize],
    kernel_id: &str,
    existing_shape_x: &[usize],
    existing_shape_y: &[usize],
    existing_kernel_id: &str,
) -> Result<(), RtasError> {
    if shape_x != existing_shape_x || shape_y != existing_shape_y || kernel_id != existing_kernel_id {
        return Err(RtasError::Protocol(format!(
            "triple_source {tag:?} already used with shapes {existing_shape_x:?}/{existing_shape_y:?} \
             and kernel {existing_kernel_id:?}, but was called again with {shape_x:?}/{shape_y:?} and {kernel_id:?}"
        )));
    }
    Ok(())
}

fn barrier_result(errs: Vec<RtasError>) -> Result<(), RtasError> {
    if errs.is_empty() {
        return Ok(());
    }
    Err(RtasError::Protocol(format!(
        "{} parallel branch(es) failed: {}",
        errs.len(),
        errs.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; ")
    )))
}

fn owner_set(owner: &[Party]) -> BTreeSet<Party> {
    owner.iter().copied().collect()
}

/// Send `obj` under `header` on a raw stream clone — used inside
/// [`barrier`] branches that need their own socket handle.
fn send_on<U: Serialize>(stream: &mut TcpStream, peer: Party, hdr: &str, obj: &U) -> Result<(), RtasError> {
    let bytes = envelope::encode(hdr, obj)?;
    transport::write_frame(stream, &bytes).map_err(|e| transport::classify_io_error(peer, e))
}

/// Receive an object under `header` on a raw stream clone.
fn recv_on<U: DeserializeOwned>(stream: &mut TcpStream, peer: Party, hdr: &str) -> Result<U, RtasError> {
    let bytes = transport::read_frame(stream).map_err(|e| transport::classify_io_error(peer, e))?;
    envelope::decode(&bytes, hdr)
}

/// The protocol engine: one instance per party, driving the value algebra
/// over a fixed transport.
pub struct Engine<T: Tensor> {
    transport: Transport,
    map: AddressMap,
    party: Party,
    config: Config,
    /// Synced generator, present on P0 and P1 after `set_up`.
    synced_prng: Option<ChaCha20Rng>,
    triple_queues: HashMap<String, TripleBucket<T>>,
    triple_counters: HashMap<String, P2Bucket>,
}

impl<T: Tensor> Engine<T> {
    /// Bind the local listening socket. Call [`Engine::connect`] once every
    /// party has done the same, then [`Engine::set_up`].
    pub fn bind(map: AddressMap, party: Party, config: Config) -> Result<Self, RtasError> {
        let transport = Transport::bind(&map, party, config.peer_timeout)?;
        Ok(Engine {
            transport,
            map,
            party,
            config,
            synced_prng: None,
            triple_queues: HashMap::new(),
            triple_counters: HashMap::new(),
        })
    }

    /// Sleep the configured grace period, then dial every peer and accept
    /// every peer, completing the full mesh (spec §4.1, §5).
    pub fn connect(&mut self) -> Result<(), RtasError> {
        std::thread::sleep(self.config.peer_init_time);
        self.transport.connect_all(&self.map, self.party, self.config.peer_timeout)
    }

    /// This engine's party.
    pub fn party(&self) -> Party {
        self.party
    }

    /// Set-up phase: P0 draws a random 64-bit seed and sends it to P1 under
    /// `random_seed`; both initialize a synced PRNG from it. P2 has nothing
    /// to synchronize (spec §4.3, "set-up").
    pub fn set_up(&mut self) -> Result<(), RtasError> {
        match self.party {
            Party::P0 => {
                let seed: u64 = rand::random();
                self.send_envelope(Party::P1, header::RANDOM_SEED, &seed)?;
                self.synced_prng = Some(ChaCha20Rng::seed_from_u64(seed));
            }
            Party::P1 => {
                let seed: u64 = self.recv_envelope(Party::P0, header::RANDOM_SEED)?;
                self.synced_prng = Some(ChaCha20Rng::seed_from_u64(seed));
            }
            Party::P2 => {}
        }
        tracing::debug!(party = %self.party, "set-up complete");
        Ok(())
    }

    fn send_envelope<U: Serialize>(&mut self, peer: Party, hdr: &str, obj: &U) -> Result<(), RtasError> {
        let bytes = envelope::encode(hdr, obj)?;
        self.transport.send(peer, &bytes)
    }

    fn recv_envelope<U: DeserializeOwned>(&mut self, peer: Party, hdr: &str) -> Result<U, RtasError> {
        let bytes = self.transport.recv(peer)?;
        envelope::decode(&bytes, hdr)
    }

    /// Close every socket. The engine is unusable afterwards.
    pub fn terminate(&mut self) {
        self.transport.terminate();
    }

    /// Construct a Private value. `owner[0]` is the generator; `get_value`
    /// runs only there. Spec §4.3, `new_private`.
    pub fn new_private(
        &mut self,
        get_value: impl FnOnce() -> T,
        owner: Vec<Party>,
        shape: Option<Vec<usize>>,
    ) -> Result<Value<T>, RtasError> {
        if owner.is_empty() {
            return Err(RtasError::Protocol("new_private: owner must be non-empty".into()));
        }
        let generator = owner[0];

        if self.party == generator {
            let value = get_value();
            for &other in owner.iter().skip(1) {
                self.send_envelope(other, header::NEW_PRIVATE, &value)?;
            }
            Ok(Value::private(Some(value), owner, shape))
        } else if owner[1..].contains(&self.party) {
            let value: T = self.recv_envelope(generator, header::NEW_PRIVATE)?;
            Ok(Value::private(Some(value), owner, shape))
        } else {
            Ok(Value::private(None, owner, shape))
        }
    }

    /// Construct a Public value. `creator` runs `get_value` and broadcasts
    /// it to the other two parties. Spec §4.3, `new_public`.
    pub fn new_public(&mut self, get_value: impl FnOnce() -> T, creator: Party) -> Result<Value<T>, RtasError> {
        if self.party == creator {
            let value = get_value();
            for &p in Party::ALL.iter() {
                if p != self.party {
                    self.send_envelope(p, header::NEW_PUBLIC, &value)?;
                }
            }
            Ok(Value::public(Some(value), vec![creator]))
        } else {
            let value: T = self.recv_envelope(creator, header::NEW_PUBLIC)?;
            Ok(Value::public(Some(value), vec![creator]))
        }
    }

    /// Split a Private value into additive shares held by P0 and P1.
    /// Spec §4.3, `share` (Case A / Case B).
    pub fn share(&mut self, value: Value<T>) -> Result<Value<T>, RtasError> {
        if value.mode() != Mode::Private {
            return Err(RtasError::Protocol("share: can only share a Private value".into()));
        }
        let generator = value.generator();

        // Case A requires a declared shape so P0 and P1 can draw matching-shape
        // masks from the synced PRNG; this is a precondition of the call, not
        // just of the branches that happen to use the shape, so every party
        // rejects it uniformly.
        if generator.is_compute() && value.shape().is_none() {
            return Err(RtasError::Protocol("share: owner must declare a shape".into()));
        }

        if self.party == generator {
            if generator.is_compute() {
                let shape = value.shape().expect("checked above").to_vec();
                let r = {
                    let synced = self.synced_prng.as_mut().ok_or_else(|| {
                        RtasError::Protocol("share: synced PRNG not initialized, call set_up first".into())
                    })?;
                    T::normal(0.0, self.config.share_std, &shape, synced)
                };
                let payload = value.into_payload().expect("generator holds the Private payload");
                Ok(Value::shared(Some(payload + r)))
            } else {
                let payload = value.into_payload().expect("P2 holds the Private payload");
                let shape = payload.shape();
                let mut rng = rand::thread_rng();
                let shared_p0 = T::normal(0.0, self.config.share_std, &shape, &mut rng);
                let shared_p1 = payload - shared_p0.clone();

                let mut s0 = self.transport.send_stream(Party::P0)?;
                let mut s1 = self.transport.send_stream(Party::P1)?;
                let errs = barrier::run_many(vec![
                    || send_on(&mut s0, Party::P0, header::SHARE, &shared_p0),
                    || send_on(&mut s1, Party::P1, header::SHARE, &shared_p1),
                ]);
                barrier_result(errs)?;
                Ok(Value::shared(None))
            }
        } else if generator.is_compute() {
            if self.party.is_compute() {
                let shape = value.shape().expect("checked above").to_vec();
                let synced = self.synced_prng.as_mut().ok_or_else(|| {
                    RtasError::Protocol("share: synced PRNG not initialized, call set_up first".into())
                })?;
                let r = T::normal(0.0, self.config.share_std, &shape, synced);
                Ok(Value::shared(Some(r / -1.0)))
            } else {
                Ok(Value::shared(None))
            }
        } else {
            // generator == P2, self is a compute party (the only remaining case).
            let my_share: T = self.recv_envelope(generator, header::SHARE)?;
            Ok(Value::shared(Some(my_share)))
        }
    }

    /// Reveal `x` to `target`. Returns `Some(payload)` on `target`, `None`
    /// everywhere else. Spec §4.3, `reveal_to`.
    pub fn reveal_to(&mut self, x: &Value<T>, target: Party) -> Result<Option<T>, RtasError> {
        match x.mode() {
            Mode::Public => Ok(x.payload().cloned()),
            Mode::Private => {
                if x.is_owned_by(target) {
                    return Ok(x.payload().cloned());
                }
                let generator = x.generator();
                if self.party == generator {
                    let payload = x
                        .payload()
                        .ok_or_else(|| RtasError::Protocol("reveal_to: generator has no payload".into()))?;
                    self.send_envelope(target, header::PRIVATE_VALUE, payload)?;
                    Ok(None)
                } else if self.party == target {
                    let value: T = self.recv_envelope(generator, header::PRIVATE_VALUE)?;
                    Ok(Some(value))
                } else {
                    Ok(None)
                }
            }
            Mode::Shared => {
                if target.is_compute() {
                    let other = target.other_compute().expect("target is a compute party");
                    if self.party == target {
                        let received: T = self.recv_envelope(other, header::ANOTHER_SHARE)?;
                        let mine = x
                            .payload()
                            .cloned()
                            .ok_or_else(|| RtasError::Protocol("reveal_to: target has no share".into()))?;
                        Ok(Some(mine + received))
                    } else if self.party.is_compute() {
                        let mine = x
                            .payload()
                            .cloned()
                            .ok_or_else(|| RtasError::Protocol("reveal_to: holder has no share".into()))?;
                        self.send_envelope(target, header::ANOTHER_SHARE, &mine)?;
                        Ok(None)
                    } else {
                        Ok(None)
                    }
                } else if self.party.is_compute() {
                    let hdr = if self.party == Party::P0 { header::SHARE_OF_P0 } else { header::SHARE_OF_P1 };
                    let mine = x
                        .payload()
                        .cloned()
                        .ok_or_else(|| RtasError::Protocol("reveal_to: holder has no share".into()))?;
                    self.send_envelope(target, hdr, &mine)?;
                    Ok(None)
                } else {
                    let mut s0 = self.transport.recv_stream(Party::P0)?;
                    let mut s1 = self.transport.recv_stream(Party::P1)?;
                    let share0: Mutex<Option<T>> = Mutex::new(None);
                    let share1: Mutex<Option<T>> = Mutex::new(None);
                    let errs = barrier::run_many(vec![
                        || {
                            let v: T = recv_on(&mut s0, Party::P0, header::SHARE_OF_P0)?;
                            *share0.lock().unwrap() = Some(v);
                            Ok(())
                        },
                        || {
                            let v: T = recv_on(&mut s1, Party::P1, header::SHARE_OF_P1)?;
                            *share1.lock().unwrap() = Some(v);
                            Ok(())
                        },
                    ]);
                    barrier_result(errs)?;
                    let a = share0.into_inner().unwrap().expect("branch populated share0");
                    let b = share1.into_inner().unwrap().expect("branch populated share1");
                    Ok(Some(a + b))
                }
            }
        }
    }

    /// Evaluate a user-supplied elementwise/linear kernel over `x` and `y`.
    /// Spec §4.3, `linear`.
    pub fn linear(&self, x: &Value<T>, y: &Value<T>, f: impl Fn(&T, &T) -> T) -> Result<Value<T>, RtasError> {
        use Mode::*;
        match (x.mode(), y.mode()) {
            (Public, Public) => {
                let owner: Vec<Party> = owner_set(x.owner()).union(&owner_set(y.owner())).copied().collect();
                let payload = f(x.payload().unwrap(), y.payload().unwrap());
                Ok(Value::public(Some(payload), owner))
            }
            (Public, Private) => {
                if y.is_owned_by(self.party) {
                    let payload = f(x.payload().unwrap(), y.payload().unwrap());
                    Ok(Value::private(Some(payload), y.owner().to_vec(), y.shape().map(|s| s.to_vec())))
                } else {
                    Ok(Value::private(None, y.owner().to_vec(), y.shape().map(|s| s.to_vec())))
                }
            }
            (Private, Public) => {
                if x.is_owned_by(self.party) {
                    let payload = f(x.payload().unwrap(), y.payload().unwrap());
                    Ok(Value::private(Some(payload), x.owner().to_vec(), x.shape().map(|s| s.to_vec())))
                } else {
                    Ok(Value::private(None, x.owner().to_vec(), x.shape().map(|s| s.to_vec())))
                }
            }
            (Private, Private) => {
                if owner_set(x.owner()) != owner_set(y.owner()) {
                    return Err(RtasError::Protocol(format!(
                        "linear: mismatched Private owners {:?} vs {:?}",
                        x.owner(),
                        y.owner()
                    )));
                }
                if x.is_owned_by(self.party) {
                    let payload = f(x.payload().unwrap(), y.payload().unwrap());
                    Ok(Value::private(Some(payload), x.owner().to_vec(), x.shape().map(|s| s.to_vec())))
                } else {
                    Ok(Value::private(None, x.owner().to_vec(), x.shape().map(|s| s.to_vec())))
                }
            }
            (Shared, Private) | (Private, Shared) => {
                Err(RtasError::Protocol("linear: mixing a Shared value with a Private value is not allowed".into()))
            }
            (Shared, Public) => {
                if self.party.is_compute() {
                    let half = y.payload().unwrap().clone() / 2.0;
                    let payload = f(x.payload().unwrap(), &half);
                    Ok(Value::shared(Some(payload)))
                } else {
                    Ok(Value::shared(None))
                }
            }
            (Public, Shared) => {
                if self.party.is_compute() {
                    let half = x.payload().unwrap().clone() / 2.0;
                    let payload = f(&half, y.payload().unwrap());
                    Ok(Value::shared(Some(payload)))
                } else {
                    Ok(Value::shared(None))
                }
            }
            (Shared, Shared) => {
                if self.party.is_compute() {
                    let payload = f(x.payload().unwrap(), y.payload().unwrap());
                    Ok(Value::shared(Some(payload)))
                } else {
                    Ok(Value::shared(None))
                }
            }
        }
    }

    /// Evaluate a user-supplied bilinear kernel over `x` and `y`. The
    /// Shared x Shared case consumes one cached Beaver triple, refilling the
    /// cache from P2 on a miss. Spec §4.3, `product`.
    #[allow(clippy::too_many_arguments)]
    pub fn product(
        &mut self,
        x: &Value<T>,
        y: &Value<T>,
        f: impl Fn(&T, &T) -> T,
        shape_x: Option<Vec<usize>>,
        shape_y: Option<Vec<usize>>,
        triple_source: &str,
        kernel_id: &str,
    ) -> Result<Value<T>, RtasError> {
        use Mode::*;
        match (x.mode(), y.mode()) {
            (Public, Public) => {
                let owner: Vec<Party> = owner_set(x.owner()).union(&owner_set(y.owner())).copied().collect();
                Ok(Value::public(Some(f(x.payload().unwrap(), y.payload().unwrap())), owner))
            }
            (Private, Public) => {
                if x.is_owned_by(self.party) {
                    Ok(Value::private(
                        Some(f(x.payload().unwrap(), y.payload().unwrap())),
                        x.owner().to_vec(),
                        x.shape().map(|s| s.to_vec()),
                    ))
                } else {
                    Ok(Value::private(None, x.owner().to_vec(), x.shape().map(|s| s.to_vec())))
                }
            }
            (Public, Private) => {
                if y.is_owned_by(self.party) {
                    Ok(Value::private(
                        Some(f(x.payload().unwrap(), y.payload().unwrap())),
                        y.owner().to_vec(),
                        y.shape().map(|s| s.to_vec()),
                    ))
                } else {
                    Ok(Value::private(None, y.owner().to_vec(), y.shape().map(|s| s.to_vec())))
                }
            }
            (Private, Private) => {
                if owner_set(x.owner()) != owner_set(y.owner()) {
                    return Err(RtasError::Protocol(format!(
                        "product: mismatched Private owners {:?} vs {:?}",
                        x.owner(),
                        y.owner()
                    )));
                }
                if x.is_owned_by(self.party) {
                    Ok(Value::private(
                        Some(f(x.payload().unwrap(), y.payload().unwrap())),
                        x.owner().to_vec(),
                        x.shape().map(|s| s.to_vec()),
                    ))
                } else {
                    Ok(Value::private(None, x.owner().to_vec(), x.shape().map(|s| s.to_vec())))
                }
            }
            (Shared, Private) | (Private, Shared) => {
                Err(RtasError::Protocol("product: cannot combine a Private value with a Shared value".into()))
            }
            (Shared, Public) => {
                if self.party.is_compute() {
                    Ok(Value::shared(Some(f(x.payload().unwrap(), y.payload().unwrap()))))
                } else {
                    Ok(Value::shared(None))
                }
            }
            (Public, Shared) => {
                if self.party.is_compute() {
                    Ok(Value::shared(Some(f(x.payload().unwrap(), y.payload().unwrap()))))
                } else {
                    Ok(Value::shared(None))
                }
            }
            (Shared, Shared) => self.product_shared_shared(x, y, f, shape_x, shape_y, triple_source, kernel_id),
        }
    }

    fn product_shared_shared(
        &mut self,
        x: &Value<T>,
        y: &Value<T>,
        f: impl Fn(&T, &T) -> T,
        shape_x: Option<Vec<usize>>,
        shape_y: Option<Vec<usize>>,
        triple_source: &str,
        kernel_id: &str,
    ) -> Result<Value<T>, RtasError> {
        let shape_x = x
            .shape()
            .map(|s| s.to_vec())
            .or(shape_x)
            .ok_or_else(|| RtasError::Protocol("product: missing shape for x".into()))?;
        let shape_y = y
            .shape()
            .map(|s| s.to_vec())
            .or(shape_y)
            .ok_or_else(|| RtasError::Protocol("product: missing shape for y".into()))?;

        if self.party == Party::P2 {
            let bucket = self.triple_counters.entry(triple_source.to_string()).or_insert_with(|| P2Bucket {
                shape_x: shape_x.clone(),
                shape_y: shape_y.clone(),
                kernel_id: kernel_id.to_string(),
                remaining: 0,
            });
            check_bucket_key(
                triple_source,
                &shape_x,
                &shape_y,
                kernel_id,
                &bucket.shape_x,
                &bucket.shape_y,
                &bucket.kernel_id,
            )?;

            if bucket.remaining == 0 {
                let mut rng = rand::thread_rng();
                let (batch_p0, batch_p1) = triples::generate_batch(
                    &shape_x,
                    &shape_y,
                    |a: &T, b: &T| f(a, b),
                    self.config.share_std,
                    self.config.cached_triples,
                    &mut rng,
                );

                let mut s0 = self.transport.send_stream(Party::P0)?;
                let mut s1 = self.transport.send_stream(Party::P1)?;
                let errs = barrier::run_many(vec![
                    || send_on(&mut s0, Party::P0, header::TRIPLES, &batch_p0),
                    || send_on(&mut s1, Party::P1, header::TRIPLES, &batch_p1),
                ]);
                barrier_result(errs)?;

                let bucket = self.triple_counters.get_mut(triple_source).unwrap();
                bucket.remaining = self.config.cached_triples;
            }

            let bucket = self.triple_counters.get_mut(triple_source).unwrap();
            bucket.remaining -= 1;

            return Ok(Value::shared(None));
        }

        let bucket = self.triple_queues.entry(triple_source.to_string()).or_insert_with(|| TripleBucket {
            shape_x: shape_x.clone(),
            shape_y: shape_y.clone(),
            kernel_id: kernel_id.to_string(),
            queue: VecDeque::new(),
        });
        check_bucket_key(
            triple_source,
            &shape_x,
            &shape_y,
            kernel_id,
            &bucket.shape_x,
            &bucket.shape_y,
            &bucket.kernel_id,
        )?;

        if bucket.queue.is_empty() {
            let batch: Vec<Triple<T>> = self.recv_envelope(Party::P2, header::TRIPLES)?;
            let bucket = self.triple_queues.get_mut(triple_source).unwrap();
            bucket.queue.extend(batch);
        }

        let triple = self
            .triple_queues
            .get_mut(triple_source)
            .unwrap()
            .queue
            .pop_front()
            .ok_or_else(|| RtasError::Protocol("product: triple cache unexpectedly empty after refill".into()))?;

        let x_payload = x.payload().ok_or_else(|| RtasError::Protocol("product: missing x share".into()))?;
        let y_payload = y.payload().ok_or_else(|| RtasError::Protocol("product: missing y share".into()))?;

        let d_i = x_payload.clone() - triple.u.clone();
        let e_i = y_payload.clone() - triple.v.clone();

        let other = self.party.other_compute().expect("compute party has a compute peer");
        let other_header = header::X_U_AND_Y_V;

        let mut send_stream = self.transport.send_stream(other)?;
        let mut recv_stream = self.transport.recv_stream(other)?;
        let other_shares: Mutex<Option<(T, T)>> = Mutex::new(None);
        let to_send = (d_i.clone(), e_i.clone());
        let errs = barrier::run_many(vec![
            || send_on(&mut send_stream, other, other_header, &to_send),
            || {
                let v: (T, T) = recv_on(&mut recv_stream, other, other_header)?;
                *other_shares.lock().unwrap() = Some(v);
                Ok(())
            },
        ]);
        barrier_result(errs)?;
        let (d_other, e_other) = other_shares.into_inner().unwrap().expect("branch populated other_shares");

        let d = d_i + d_other;
        let e = e_i + e_other;

        let result = if self.party == Party::P0 {
            f(&d, &e) + f(&triple.u, &e) + f(&d, &triple.v) + triple.w
        } else {
            f(&triple.u, &e) + f(&d, &triple.v) + triple.w
        };

        Ok(Value::shared(Some(result)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::NdTensor;
    use approx::assert_abs_diff_eq;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn scenario_map(port: u16) -> AddressMap {
        AddressMap::new(vec![
            (format!("127.0.0.1:{port}"), Party::P0),
            (format!("127.0.0.1:{}", port + 1), Party::P1),
            (format!("127.0.0.1:{}", port + 2), Party::P2),
        ])
        .unwrap()
    }

    fn build_engine(port: u16, party: Party, cached_triples: usize) -> Engine<NdTensor> {
        let map = scenario_map(port);
        let config = Config {
            peer_init_time: Duration::from_millis(50),
            peer_timeout: Duration::from_secs(3),
            share_std: 5.0,
            cached_triples,
        };
        let mut engine = Engine::bind(map, party, config).unwrap();
        engine.connect().unwrap();
        engine.set_up().unwrap();
        engine
    }

    /// Run `f` identically on all three parties, each on its own thread and
    /// its own engine, and return `(P0's result, P1's, P2's)`.
    fn run_all<F, R>(port: u16, cached_triples: usize, f: F) -> (R, R, R)
    where
        F: Fn(&mut Engine<NdTensor>) -> R + Send + Sync + 'static,
        R: Send + 'static,
    {
        let f = Arc::new(f);
        let (f0, f1, f2) = (f.clone(), f.clone(), f.clone());

        let h0 = thread::spawn(move || {
            let mut e = build_engine(port, Party::P0, cached_triples);
            let r = f0(&mut e);
            e.terminate();
            r
        });
        let h1 = thread::spawn(move || {
            let mut e = build_engine(port, Party::P1, cached_triples);
            let r = f1(&mut e);
            e.terminate();
            r
        });
        let h2 = thread::spawn(move || {
            let mut e = build_engine(port, Party::P2, cached_triples);
            let r = f2(&mut e);
            e.terminate();
            r
        });

        (h0.join().unwrap(), h1.join().unwrap(), h2.join().unwrap())
    }

    fn assert_tensors_close(a: &NdTensor, b: &NdTensor) {
        assert_eq!(a.shape(), b.shape());
        for (x, y) in a.0.iter().zip(b.0.iter()) {
            assert_abs_diff_eq!(*x, *y, epsilon = 1e-6);
        }
    }

    #[test]
    fn new_private_reaches_only_named_owners() {
        let value = NdTensor::from_shape_vec(&[3], vec![1.0, 2.0, 3.0]);
        let (r0, r1, r2) = run_all(15300, 4, move |e| {
            e.new_private(|| value.clone(), vec![Party::P0], Some(vec![3])).unwrap()
        });
        assert!(r0.payload().is_some());
        assert!(r1.payload().is_none());
        assert!(r2.payload().is_none());
    }

    #[test]
    fn new_private_broadcasts_to_every_named_owner() {
        let value = NdTensor::from_shape_vec(&[2], vec![9.0, -1.0]);
        let (r0, r1, r2) = run_all(15310, 4, move |e| {
            e.new_private(|| value.clone(), vec![Party::P0, Party::P1], None).unwrap()
        });
        assert_tensors_close(r0.payload().unwrap(), r1.payload().unwrap());
        assert!(r2.payload().is_none());
    }

    #[test]
    fn new_public_reaches_every_party() {
        let value = NdTensor::from_shape_vec(&[3], vec![1.0, 2.0, 3.0]);
        let (r0, r1, r2) = run_all(15320, 4, move |e| {
            e.new_public(|| value.clone(), Party::P2).unwrap()
        });
        assert_tensors_close(r0.payload().unwrap(), r1.payload().unwrap());
        assert_tensors_close(r1.payload().unwrap(), r2.payload().unwrap());
    }

    #[test]
    fn share_case_a_compute_owner_recovers_plaintext() {
        let value = NdTensor::from_shape_vec(&[3], vec![4.0, 5.0, 6.0]);
        let (r0, r1, r2) = run_all(15330, 4, move |e| {
            let private = e.new_private(|| value.clone(), vec![Party::P0], Some(vec![3])).unwrap();
            e.share(private).unwrap()
        });
        let sum = r0.payload().unwrap().clone() + r1.payload().unwrap().clone();
        assert_tensors_close(&sum, &NdTensor::from_shape_vec(&[3], vec![4.0, 5.0, 6.0]));
        assert!(r2.payload().is_none());
    }

    #[test]
    fn share_case_b_assistant_owner_recovers_plaintext() {
        let value = NdTensor::from_shape_vec(&[3], vec![-2.0, 0.5, 3.5]);
        let (r0, r1, r2) = run_all(15340, 4, move |e| {
            let private = e.new_private(|| value.clone(), vec![Party::P2], Some(vec![3])).unwrap();
            e.share(private).unwrap()
        });
        let sum = r0.payload().unwrap().clone() + r1.payload().unwrap().clone();
        assert_tensors_close(&sum, &NdTensor::from_shape_vec(&[3], vec![-2.0, 0.5, 3.5]));
        assert!(r2.payload().is_none());
    }

    #[test]
    fn reveal_to_private_owner_is_a_local_noop() {
        let value = NdTensor::from_shape_vec(&[2], vec![7.0, 8.0]);
        let (r0, r1, r2) = run_all(15350, 4, move |e| {
            let private = e.new_private(|| value.clone(), vec![Party::P0], Some(vec![2])).unwrap();
            e.reveal_to(&private, Party::P0).unwrap()
        });
        assert!(r0.is_some());
        assert!(r1.is_none());
        assert!(r2.is_none());
    }

    #[test]
    fn reveal_to_private_sends_from_generator_to_target() {
        let value = NdTensor::from_shape_vec(&[2], vec![7.0, 8.0]);
        let (r0, r1, r2) = run_all(15360, 4, move |e| {
            let private = e.new_private(|| value.clone(), vec![Party::P0], Some(vec![2])).unwrap();
            e.reveal_to(&private, Party::P2).unwrap()
        });
        assert!(r0.is_none());
        assert!(r1.is_none());
        assert_tensors_close(&r2.unwrap(), &NdTensor::from_shape_vec(&[2], vec![7.0, 8.0]));
    }

    #[test]
    fn reveal_shared_to_compute_party_recombines_shares() {
        let value = NdTensor::from_shape_vec(&[2], vec![1.0, -1.0]);
        let (r0, r1, r2) = run_all(15370, 4, move |e| {
            let private = e.new_private(|| value.clone(), vec![Party::P0], Some(vec![2])).unwrap();
            let shared = e.share(private).unwrap();
            e.reveal_to(&shared, Party::P0).unwrap()
        });
        assert_tensors_close(&r0.unwrap(), &NdTensor::from_shape_vec(&[2], vec![1.0, -1.0]));
        assert!(r1.is_none());
        assert!(r2.is_none());
    }

    #[test]
    fn reveal_shared_to_assistant_recombines_both_shares() {
        let value = NdTensor::from_shape_vec(&[2], vec![3.0, 4.0]);
        let (r0, r1, r2) = run_all(15380, 4, move |e| {
            let private = e.new_private(|| value.clone(), vec![Party::P0], Some(vec![2])).unwrap();
            let shared = e.share(private).unwrap();
            e.reveal_to(&shared, Party::P2).unwrap()
        });
        assert!(r0.is_none());
        assert!(r1.is_none());
        assert_tensors_close(&r2.unwrap(), &NdTensor::from_shape_vec(&[2], vec![3.0, 4.0]));
    }

    #[test]
    fn linear_combines_shared_and_public_matching_plaintext() {
        let shared_val = NdTensor::from_shape_vec(&[2], vec![2.0, -3.0]);
        let public_val = NdTensor::from_shape_vec(&[2], vec![10.0, 20.0]);
        let (r0, r1, r2) = run_all(15390, 4, move |e| {
            let private = e.new_private(|| shared_val.clone(), vec![Party::P0], Some(vec![2])).unwrap();
            let shared = e.share(private).unwrap();
            let public = e.new_public(|| public_val.clone(), Party::P2).unwrap();
            let sum = e.linear(&shared, &public, NdTensor::add_kernel).unwrap();
            e.reveal_to(&sum, Party::P2).unwrap()
        });
        assert!(r0.is_none());
        assert!(r1.is_none());
        assert_tensors_close(&r2.unwrap(), &NdTensor::from_shape_vec(&[2], vec![12.0, 17.0]));
    }

    #[test]
    fn linear_private_private_mismatched_owners_is_an_error() {
        let val = NdTensor::from_shape_vec(&[2], vec![1.0, 1.0]);
        let (r0, r1, r2) = run_all(15400, 4, move |e| {
            let a = e.new_private(|| val.clone(), vec![Party::P0], Some(vec![2])).unwrap();
            let b = e.new_private(|| val.clone(), vec![Party::P1], Some(vec![2])).unwrap();
            e.linear(&a, &b, NdTensor::add_kernel)
        });
        assert!(r0.is_err());
        assert!(r1.is_err());
        assert!(r2.is_err());
    }

    #[test]
    fn linear_shared_private_mix_is_an_error() {
        let val = NdTensor::from_shape_vec(&[2], vec![1.0, 1.0]);
        let (r0, r1, r2) = run_all(15410, 4, move |e| {
            let private = e.new_private(|| val.clone(), vec![Party::P0], Some(vec![2])).unwrap();
            let shared = e.share(private).unwrap();
            let other_private = e.new_private(|| val.clone(), vec![Party::P0], Some(vec![2])).unwrap();
            e.linear(&shared, &other_private, NdTensor::add_kernel)
        });
        assert!(r0.is_err());
        assert!(r1.is_err());
        assert!(r2.is_err());
    }

    #[test]
    fn product_shared_shared_consumes_beaver_triples_correctly() {
        let x_val = NdTensor::from_shape_vec(&[2], vec![2.0, 3.0]);
        let y_val = NdTensor::from_shape_vec(&[2], vec![5.0, -1.0]);
        let (r0, r1, r2) = run_all(15420, 2, move |e| {
            let x_priv = e.new_private(|| x_val.clone(), vec![Party::P0], Some(vec![2])).unwrap();
            let y_priv = e.new_private(|| y_val.clone(), vec![Party::P1], Some(vec![2])).unwrap();
            let x_shared = e.share(x_priv).unwrap();
            let y_shared = e.share(y_priv).unwrap();
            let product = e
                .product(
                    &x_shared,
                    &y_shared,
                    NdTensor::mul_kernel,
                    Some(vec![2]),
                    Some(vec![2]),
                    "mul-tag",
                    "mul",
                )
                .unwrap();
            e.reveal_to(&product, Party::P2).unwrap()
        });
        assert!(r0.is_none());
        assert!(r1.is_none());
        assert_tensors_close(&r2.unwrap(), &NdTensor::from_shape_vec(&[2], vec![10.0, -3.0]));
    }

    #[test]
    fn product_triple_cache_amortizes_across_repeated_calls() {
        let cached_triples = 4;
        let a = NdTensor::from_shape_vec(&[2], vec![1.0, 1.0]);
        let b = NdTensor::from_shape_vec(&[2], vec![2.0, 2.0]);
        let (_r0, _r1, batches_sent) = run_all(15440, cached_triples, move |e| {
            let x_priv = e.new_private(|| a.clone(), vec![Party::P0], Some(vec![2])).unwrap();
            let y_priv = e.new_private(|| b.clone(), vec![Party::P1], Some(vec![2])).unwrap();
            let x = e.share(x_priv).unwrap();
            let y = e.share(y_priv).unwrap();

            let mut batches_sent = 0usize;
            for _ in 0..10 {
                if e.party() == Party::P2 {
                    let remaining =
                        e.triple_counters.get("amortize-tag").map(|bucket| bucket.remaining).unwrap_or(0);
                    if remaining == 0 {
                        batches_sent += 1;
                    }
                }
                e.product(&x, &y, NdTensor::mul_kernel, Some(vec![2]), Some(vec![2]), "amortize-tag", "mul")
                    .unwrap();
            }
            batches_sent
        });
        // 10 products, cached_triples=4: a fresh batch is requested on products
        // 1, 5, and 9 — ceil(10/4) = 3.
        assert_eq!(batches_sent, 3);
    }

    #[test]
    fn share_of_a_non_private_value_is_an_error() {
        let value = NdTensor::from_shape_vec(&[3], vec![1.0, 2.0, 3.0]);
        let (r0, r1, r2) = run_all(15450, 4, move |e| {
            let public = e.new_public(|| value.clone(), Party::P2).unwrap();
            e.share(public)
        });
        assert!(r0.is_err());
        assert!(r1.is_err());
        assert!(r2.is_err());
    }

    #[test]
    fn share_of_compute_owned_private_with_no_shape_is_an_error() {
        let value = NdTensor::from_shape_vec(&[3], vec![1.0, 2.0, 3.0]);
        let (r0, r1, r2) = run_all(15460, 4, move |e| {
            let private = e.new_private(|| value.clone(), vec![Party::P0], None).unwrap();
            e.share(private)
        });
        assert!(r0.is_err());
        assert!(r1.is_err());
        assert!(r2.is_err());
    }

    #[test]
    fn product_triple_cache_rejects_shape_reuse_under_same_tag() {
        let (r0, r1, r2) = run_all(15430, 4, move |e| {
            let a3 = NdTensor::from_shape_vec(&[3], vec![1.0, 1.0, 1.0]);
            let b3 = NdTensor::from_shape_vec(&[3], vec![2.0, 2.0, 2.0]);
            let a4 = NdTensor::from_shape_vec(&[4], vec![1.0, 1.0, 1.0, 1.0]);
            let b4 = NdTensor::from_shape_vec(&[4], vec![2.0, 2.0, 2.0, 2.0]);

            let x3 = e.new_private(|| a3.clone(), vec![Party::P0], Some(vec![3])).unwrap();
            let y3 = e.new_private(|| b3.clone(), vec![Party::P1], Some(vec![3])).unwrap();
            let x3 = e.share(x3).unwrap();
            let y3 = e.share(y3).unwrap();
            e.product(&x3, &y3, NdTensor::mul_kernel, Some(vec![3]), Some(vec![3]), "reused-tag", "mul")
                .unwrap();

            let x4 = e.new_private(|| a4.clone(), vec![Party::P0], Some(vec![4])).unwrap();
            let y4 = e.new_private(|| b4.clone(), vec![Party::P1], Some(vec![4])).unwrap();
            let x4 = e.share(x4).unwrap();
            let y4 = e.share(y4).unwrap();
            e.product(&x4, &y4, NdTensor::mul_kernel, Some(vec![4]), Some(vec![4]), "reused-tag", "mul")
        });
        assert!(r0.is_err());
        assert!(r1.is_err());
        assert!(r2.is_err());
    }
}
