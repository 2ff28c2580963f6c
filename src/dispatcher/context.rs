use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

/// Ключ, под которым исполнитель кладет клиент API в контекст.
pub const API_CLIENT_KEY: &str = "api_client";

type Value = Arc<dyn Any + Send + Sync>;

/// Общий изменяемый набор зависимостей, который получают обработчики и хуки.
///
/// Клонирование дешевое: все клоны смотрят на одно и то же хранилище.
#[derive(Clone, Default)]
pub struct HandlerContext {
    values: Arc<RwLock<HashMap<String, Value>>>,
}

impl HandlerContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Кладет значение под ключ, возвращая `true`, если ключ уже был занят.
    pub fn insert<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) -> bool {
        self.insert_arc(key, Arc::new(value))
    }

    pub fn insert_arc<T: Any + Send + Sync>(&self, key: impl Into<String>, value: Arc<T>) -> bool {
        self.values
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), value)
            .is_some()
    }

    /// Достает значение, если оно есть и имеет тип `T`.
    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        let value = self
            .values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()?;
        value.downcast::<T>().ok()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    pub fn remove(&self, key: &str) -> bool {
        self.values
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
            .is_some()
    }

    /// Клиент API, положенный исполнителем.
    pub fn api_client<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.get(API_CLIENT_KEY)
    }
}

impl std::fmt::Debug for HandlerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let values = self.values.read().unwrap_or_else(PoisonError::into_inner);
        let mut keys: Vec<&String> = values.keys().collect();
        keys.sort();
        f.debug_struct("HandlerContext").field("keys", &keys).finish()
    }
}
