use crate::headers::Headers;
use crate::payload::Payload;
use crate::value::Value;

/// Body plus headers flowing through a route.
///
/// `Clone` is the explicit copy: the header map is duplicated, the body is
/// shared because payloads are immutable.
#[derive(Debug, Clone, Default)]
pub struct Message {
    body: Payload,
    headers: Headers,
}

impl Message {
    pub fn new(body: impl Into<Payload>) -> Self {
        Self {
            body: body.into(),
            headers: Headers::new(),
        }
    }

    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.headers.insert(key, value);
        self
    }

    #[must_use]
    pub fn body(&self) -> &Payload {
        &self.body
    }

    pub fn set_body(&mut self, body: impl Into<Payload>) {
        self.body = body.into();
    }

    /// Borrows the body as `T` without conversion.
    #[must_use]
    pub fn body_ref<T: std::any::Any>(&self) -> Option<&T> {
        self.body.downcast_ref::<T>()
    }

    #[must_use]
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    #[must_use]
    pub fn header(&self, key: &str) -> Option<&Value> {
        self.headers.get(key)
    }

    pub fn set_header(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.headers.insert(key, value);
    }

    pub fn remove_header(&mut self, key: &str) -> Option<Value> {
        self.headers.remove(key)
    }
}
