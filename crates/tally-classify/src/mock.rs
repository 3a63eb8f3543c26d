//! Scriptable classifier for tests and local development.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use tally_core::{Category, Classifier, ClassificationResult, Error, Result, TransactionFacts};

/// One scripted outcome for a [`MockClassifier`] call.
#[derive(Debug, Clone)]
pub enum MockOutcome {
    Succeed(ClassificationResult),
    Timeout,
    Fail(String),
}

/// Classifier that replays a script of outcomes, then repeats a default.
///
/// Calls are counted so tests can assert retry behavior.
pub struct MockClassifier {
    script: Mutex<VecDeque<MockOutcome>>,
    default: ClassificationResult,
    calls: AtomicUsize,
}

impl MockClassifier {
    /// Always return the same result.
    pub fn always(result: ClassificationResult) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            default: result,
            calls: AtomicUsize::new(0),
        }
    }

    /// Consume the scripted outcomes in order, then fall back to `default`.
    pub fn with_script(script: Vec<MockOutcome>, default: ClassificationResult) -> Self {
        Self {
            script: Mutex::new(script.into()),
            default,
            calls: AtomicUsize::new(0),
        }
    }

    /// A plain confident result, handy as a script default.
    pub fn confident(category: Category, confidence: f64) -> ClassificationResult {
        ClassificationResult::new(category, confidence, "scripted")
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Classifier for MockClassifier {
    async fn classify(&self, _facts: &TransactionFacts) -> Result<ClassificationResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = {
            let mut script = self.script.lock().unwrap_or_else(|e| e.into_inner());
            script.pop_front()
        };
        match next {
            Some(MockOutcome::Succeed(result)) => Ok(result),
            Some(MockOutcome::Timeout) => Err(Error::ClassificationTimeout(
                "scripted timeout".to_string(),
            )),
            Some(MockOutcome::Fail(message)) => Err(Error::Classification(message)),
            None => Ok(self.default.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn facts() -> TransactionFacts {
        TransactionFacts {
            amount: 10.0,
            description: "coffee".to_string(),
            merchant: None,
            date: None,
            metadata: None,
        }
    }

    #[tokio::test]
    async fn test_script_then_default() {
        let mock = MockClassifier::with_script(
            vec![
                MockOutcome::Timeout,
                MockOutcome::Succeed(MockClassifier::confident(Category::Travel, 0.8)),
            ],
            MockClassifier::confident(Category::Other, 0.1),
        );

        assert!(matches!(
            mock.classify(&facts()).await,
            Err(Error::ClassificationTimeout(_))
        ));
        let second = mock.classify(&facts()).await.unwrap();
        assert_eq!(second.category, Category::Travel);
        let third = mock.classify(&facts()).await.unwrap();
        assert_eq!(third.category, Category::Other);
        assert_eq!(mock.calls(), 3);
    }
}
