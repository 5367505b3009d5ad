use std::any::{Any, TypeId};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;

use crate::error::ConversionError;
use crate::payload::{Payload, TypeKey};

/// Maximum number of promotion hops walked during lookup step (b).
const MAX_PROMOTION_DEPTH: usize = 4;

type ConvertFn = Arc<dyn Fn(&Payload) -> Result<Payload, ConversionError> + Send + Sync>;

// ---------------------------------------------------------------------------
// FallbackConverter
// ---------------------------------------------------------------------------

/// Value-dependent converter consulted after every typed path failed.
///
/// Returns `None` when it does not apply to the given value/target, so the
/// next fallback gets a chance.
pub trait FallbackConverter: Send + Sync {
    fn name(&self) -> &'static str;

    fn try_convert(
        &self,
        value: &Payload,
        target: TypeKey,
    ) -> Option<Result<Payload, ConversionError>>;
}

// ---------------------------------------------------------------------------
// Resolution cache
// ---------------------------------------------------------------------------

/// Type-level lookup result for one (source, target) pair.
#[derive(Clone)]
enum Resolution {
    /// Steps applied in order: promotions, then optionally a converter.
    Path(Vec<ConvertFn>),
    /// No typed path; only fallbacks may apply.
    Untyped,
}

struct CachedResolution {
    version: u64,
    resolution: Resolution,
}

// ---------------------------------------------------------------------------
// TypeConverterRegistry
// ---------------------------------------------------------------------------

/// Registry of converters keyed by (source type, target type).
///
/// Registration is allowed at any time, concurrently with lookups. Each
/// registration bumps a version counter; cached type-level resolutions
/// (including "no typed path") carry the version they were computed at and
/// are recomputed once stale, so nothing is negatively cached for good.
pub struct TypeConverterRegistry {
    converters: DashMap<(TypeId, TypeId), ConvertFn>,
    promotions: DashMap<TypeId, Vec<(TypeKey, ConvertFn)>>,
    fallbacks: RwLock<Vec<Arc<dyn FallbackConverter>>>,
    cache: DashMap<(TypeId, TypeId), CachedResolution>,
    version: AtomicU64,
}

impl TypeConverterRegistry {
    /// Creates an empty registry without any built-in converters.
    #[must_use]
    pub fn new() -> Self {
        Self {
            converters: DashMap::new(),
            promotions: DashMap::new(),
            fallbacks: RwLock::new(Vec::new()),
            cache: DashMap::new(),
            version: AtomicU64::new(0),
        }
    }

    /// Creates a registry pre-populated with [`super::register_defaults`].
    #[must_use]
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        super::builtin::register_defaults(&registry);
        registry
    }

    /// Registers (or replaces) the converter from `S` to `T`.
    pub fn register<S, T, F>(&self, convert: F)
    where
        S: Any + Send + Sync,
        T: Any + Send + Sync,
        F: Fn(&S) -> Result<T, ConversionError> + Send + Sync + 'static,
    {
        let step: ConvertFn = Arc::new(move |payload: &Payload| {
            let source = payload.downcast_ref::<S>().ok_or_else(|| {
                ConversionError::failed::<S, T>(format!("payload holds {}", payload.type_name()))
            })?;
            convert(source).map(Payload::new)
        });
        self.converters
            .insert((TypeId::of::<S>(), TypeId::of::<T>()), step);
        self.bump("converter", TypeKey::of::<S>(), TypeKey::of::<T>());
    }

    /// Declares that `S` can be viewed as the more general type `M`.
    ///
    /// Converters registered for `M` then apply to `S` values too.
    pub fn register_promotion<S, M, F>(&self, promote: F)
    where
        S: Any + Send + Sync,
        M: Any + Send + Sync,
        F: Fn(&S) -> M + Send + Sync + 'static,
    {
        let step: ConvertFn = Arc::new(move |payload: &Payload| {
            payload
                .downcast_ref::<S>()
                .map(|source| Payload::new(promote(source)))
                .ok_or_else(|| {
                    ConversionError::failed::<S, M>(format!(
                        "payload holds {}",
                        payload.type_name()
                    ))
                })
        });
        self.promotions
            .entry(TypeId::of::<S>())
            .or_default()
            .push((TypeKey::of::<M>(), step));
        self.bump("promotion", TypeKey::of::<S>(), TypeKey::of::<M>());
    }

    /// Appends a fallback converter.
    pub fn add_fallback(&self, fallback: Arc<dyn FallbackConverter>) {
        tracing::debug!(fallback = fallback.name(), "registered fallback converter");
        self.fallbacks.write().push(fallback);
        self.version.fetch_add(1, Ordering::AcqRel);
    }

    fn bump(&self, kind: &'static str, from: TypeKey, to: TypeKey) {
        let version = self.version.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::trace!(kind, from = from.name(), to = to.name(), version, "registered type converter");
    }

    /// Current registry version; increases on every registration.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Number of exact converters registered.
    #[must_use]
    pub fn converter_count(&self) -> usize {
        self.converters.len()
    }

    /// Whether a typed path (exact or through promotions) exists.
    /// Fallbacks are value-dependent and not considered.
    #[must_use]
    pub fn has_typed_path(&self, source: TypeKey, target: TypeKey) -> bool {
        source == target || matches!(self.resolve(source, target), Resolution::Path(_))
    }

    /// Converts `value` to the `target` type.
    ///
    /// # Errors
    ///
    /// Returns `ConversionError::NoConverter` when no path exists, or the
    /// error of the converter that rejected the value.
    pub fn convert(&self, value: &Payload, target: TypeKey) -> Result<Payload, ConversionError> {
        let source = value.type_key();
        if source == target {
            return Ok(value.clone());
        }

        if let Resolution::Path(steps) = self.resolve(source, target) {
            let mut current = value.clone();
            for step in &steps {
                current = step(&current)?;
            }
            return Ok(current);
        }

        // Snapshot so no lock is held while a fallback runs.
        let fallbacks = self.fallbacks.read().clone();
        for fallback in &fallbacks {
            if let Some(result) = fallback.try_convert(value, target) {
                return result;
            }
        }

        Err(ConversionError::NoConverter {
            from: source.name(),
            to: target.name(),
        })
    }

    /// Typed variant of [`convert`](Self::convert).
    ///
    /// # Errors
    ///
    /// Same as [`convert`](Self::convert); additionally fails if a converter
    /// produced a value of the wrong type.
    pub fn convert_to<T: Any + Clone>(&self, value: &Payload) -> Result<T, ConversionError> {
        if let Some(direct) = value.downcast_ref::<T>() {
            return Ok(direct.clone());
        }
        let converted = self.convert(value, TypeKey::of::<T>())?;
        converted
            .get::<T>()
            .ok_or_else(|| ConversionError::Failed {
                from: value.type_name(),
                to: std::any::type_name::<T>(),
                reason: format!("converter produced {}", converted.type_name()),
            })
    }

    /// Like [`convert_to`](Self::convert_to) but maps every failure to `None`,
    /// for callers that treat a missing conversion as "skip".
    #[must_use]
    pub fn try_convert_to<T: Any + Clone>(&self, value: &Payload) -> Option<T> {
        self.convert_to(value).ok()
    }

    fn resolve(&self, source: TypeKey, target: TypeKey) -> Resolution {
        let key = (source.id(), target.id());
        let version = self.version();

        if let Some(cached) = self.cache.get(&key) {
            if cached.version == version {
                return cached.resolution.clone();
            }
        }

        let resolution = self.search(source, target);
        self.cache.insert(
            key,
            CachedResolution {
                version,
                resolution: resolution.clone(),
            },
        );
        resolution
    }

    /// Exact converter first, then breadth-first over promotions.
    fn search(&self, source: TypeKey, target: TypeKey) -> Resolution {
        if let Some(exact) = self.converters.get(&(source.id(), target.id())) {
            return Resolution::Path(vec![exact.value().clone()]);
        }

        let mut visited = HashSet::from([source.id()]);
        let mut frontier: VecDeque<(TypeKey, Vec<ConvertFn>)> =
            VecDeque::from([(source, Vec::new())]);

        while let Some((current, chain)) = frontier.pop_front() {
            if chain.len() >= MAX_PROMOTION_DEPTH {
                continue;
            }
            let Some(promotions) = self
                .promotions
                .get(&current.id())
                .map(|entry| entry.value().clone())
            else {
                continue;
            };

            for (promoted, step) in promotions {
                if !visited.insert(promoted.id()) {
                    continue;
                }
                let mut next = chain.clone();
                next.push(step);

                if promoted == target {
                    return Resolution::Path(next);
                }
                if let Some(exact) = self.converters.get(&(promoted.id(), target.id())) {
                    next.push(exact.value().clone());
                    return Resolution::Path(next);
                }
                frontier.push_back((promoted, next));
            }
        }

        Resolution::Untyped
    }
}

impl Default for TypeConverterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TypeConverterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeConverterRegistry")
            .field("converters", &self.converters.len())
            .field("promotions", &self.promotions.len())
            .field("fallbacks", &self.fallbacks.read().len())
            .field("version", &self.version())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Celsius(f64);

    #[derive(Debug, Clone, PartialEq)]
    struct Fahrenheit(f64);

    #[derive(Debug, Clone, PartialEq)]
    struct Reading(f64);

    #[test]
    fn identity_needs_no_converter() {
        let registry = TypeConverterRegistry::new();
        let value = registry
            .convert_to::<Celsius>(&Payload::new(Celsius(21.0)))
            .unwrap();
        assert_eq!(value, Celsius(21.0));
    }

    #[test]
    fn exact_converter_is_used() {
        let registry = TypeConverterRegistry::new();
        registry.register::<Celsius, Fahrenheit, _>(|c| Ok(Fahrenheit(c.0 * 9.0 / 5.0 + 32.0)));

        let f = registry
            .convert_to::<Fahrenheit>(&Payload::new(Celsius(100.0)))
            .unwrap();
        assert_eq!(f, Fahrenheit(212.0));
    }

    #[test]
    fn missing_converter_reports_both_types() {
        let registry = TypeConverterRegistry::new();
        let err = registry
            .convert_to::<Fahrenheit>(&Payload::new(Celsius(1.0)))
            .unwrap_err();
        assert!(matches!(err, ConversionError::NoConverter { .. }));
        assert!(err.to_string().contains("Celsius"));
        assert!(err.to_string().contains("Fahrenheit"));
    }

    #[test]
    fn promotion_reaches_converter_of_general_type() {
        let registry = TypeConverterRegistry::new();
        registry.register_promotion::<Reading, Celsius, _>(|r| Celsius(r.0));
        registry.register::<Celsius, Fahrenheit, _>(|c| Ok(Fahrenheit(c.0 * 9.0 / 5.0 + 32.0)));

        let f = registry
            .convert_to::<Fahrenheit>(&Payload::new(Reading(0.0)))
            .unwrap();
        assert_eq!(f, Fahrenheit(32.0));
        // A promotion target is itself assignable.
        assert_eq!(
            registry.convert_to::<Celsius>(&Payload::new(Reading(5.0))).unwrap(),
            Celsius(5.0)
        );
    }

    #[test]
    fn promotion_cycles_terminate() {
        let registry = TypeConverterRegistry::new();
        registry.register_promotion::<Reading, Celsius, _>(|r| Celsius(r.0));
        registry.register_promotion::<Celsius, Reading, _>(|c| Reading(c.0));

        assert!(registry
            .convert_to::<Fahrenheit>(&Payload::new(Reading(1.0)))
            .is_err());
    }

    #[test]
    fn late_registration_invalidates_negative_lookup() {
        let registry = TypeConverterRegistry::new();
        let payload = Payload::new(Celsius(0.0));
        assert!(registry.convert_to::<Fahrenheit>(&payload).is_err());

        let before = registry.version();
        registry.register::<Celsius, Fahrenheit, _>(|c| Ok(Fahrenheit(c.0 * 9.0 / 5.0 + 32.0)));
        assert!(registry.version() > before);

        assert_eq!(
            registry.convert_to::<Fahrenheit>(&payload).unwrap(),
            Fahrenheit(32.0)
        );
    }

    #[test]
    fn converter_failure_is_propagated() {
        let registry = TypeConverterRegistry::new();
        registry.register::<Celsius, Fahrenheit, _>(|c| {
            if c.0 < -273.15 {
                Err(ConversionError::failed::<Celsius, Fahrenheit>("below absolute zero"))
            } else {
                Ok(Fahrenheit(c.0 * 9.0 / 5.0 + 32.0))
            }
        });

        let err = registry
            .convert_to::<Fahrenheit>(&Payload::new(Celsius(-300.0)))
            .unwrap_err();
        assert!(matches!(err, ConversionError::Failed { .. }));
    }

    struct ReadingFallback;

    impl FallbackConverter for ReadingFallback {
        fn name(&self) -> &'static str {
            "reading"
        }

        fn try_convert(
            &self,
            value: &Payload,
            target: TypeKey,
        ) -> Option<Result<Payload, ConversionError>> {
            if target != TypeKey::of::<Reading>() {
                return None;
            }
            value
                .downcast_ref::<Fahrenheit>()
                .map(|f| Ok(Payload::new(Reading(f.0))))
        }
    }

    #[test]
    fn fallback_consulted_after_typed_paths() {
        let registry = TypeConverterRegistry::new();
        registry.add_fallback(Arc::new(ReadingFallback));

        assert_eq!(
            registry
                .convert_to::<Reading>(&Payload::new(Fahrenheit(50.0)))
                .unwrap(),
            Reading(50.0)
        );
        assert!(registry
            .convert_to::<Reading>(&Payload::new(Celsius(50.0)))
            .is_err());
        assert!(!registry.has_typed_path(TypeKey::of::<Fahrenheit>(), TypeKey::of::<Reading>()));
    }
}
