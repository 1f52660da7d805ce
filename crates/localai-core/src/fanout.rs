//! Fan-in of concurrent result streams.
//!
//! [`fan_in`] polls every input concurrently and keeps results grouped by
//! input in the order each input produced them. Errors are collected with
//! the index of the input that produced them; nothing is dropped.

use futures::stream::{self, Stream, StreamExt};

/// Merged output of [`fan_in`].
#[derive(Debug)]
pub struct FanIn<T, E> {
    /// `results[i]` holds the successful items of input `i`, in order.
    pub results: Vec<Vec<T>>,
    /// Errors tagged with their input index, in arrival order.
    pub errors: Vec<(usize, E)>,
}

impl<T, E> FanIn<T, E> {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    /// Flatten results in input order.
    pub fn into_flat(self) -> (Vec<T>, Vec<(usize, E)>) {
        (self.results.into_iter().flatten().collect(), self.errors)
    }
}

/// Merge `inputs` concurrently.
pub async fn fan_in<T, E, S>(inputs: Vec<S>) -> FanIn<T, E>
where
    S: Stream<Item = Result<T, E>> + Unpin,
{
    let count = inputs.len();
    let tagged = inputs
        .into_iter()
        .enumerate()
        .map(|(index, input)| input.map(move |item| (index, item)));

    let mut merged = stream::select_all(tagged);
    let mut results: Vec<Vec<T>> = (0..count).map(|_| Vec::new()).collect();
    let mut errors = Vec::new();

    while let Some((index, item)) = merged.next().await {
        match item {
            Ok(value) => results[index].push(value),
            Err(e) => errors.push((index, e)),
        }
    }

    FanIn { results, errors }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_fan_in_preserves_per_input_order() {
        let a = stream::iter(vec![Ok(1), Ok(2), Err("a-fail"), Ok(3)]);
        let b = stream::iter(vec![Ok(10), Err("b-fail"), Ok(20)]);

        let merged = fan_in(vec![a, b]).await;

        assert_eq!(merged.results[0], vec![1, 2, 3]);
        assert_eq!(merged.results[1], vec![10, 20]);
        assert_eq!(merged.errors.len(), 2);
        assert!(merged.errors.contains(&(0, "a-fail")));
        assert!(merged.errors.contains(&(1, "b-fail")));
    }

    #[tokio::test]
    async fn test_fan_in_polls_inputs_concurrently() {
        let slow = stream::once(async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<_, String>("slow")
        })
        .boxed();
        let fast = stream::iter(vec![Ok("fast-1"), Err("fast-fail".to_string()), Ok("fast-2")]).boxed();

        let started = std::time::Instant::now();
        let merged = fan_in(vec![slow, fast]).await;
        assert!(started.elapsed() < Duration::from_millis(400));

        let (flat, errors) = merged.into_flat();
        assert_eq!(flat, vec!["slow", "fast-1", "fast-2"]);
        assert_eq!(errors, vec![(1, "fast-fail".to_string())]);
    }

    #[tokio::test]
    async fn test_empty_inputs() {
        let merged = fan_in::<u8, (), stream::Iter<std::vec::IntoIter<Result<u8, ()>>>>(vec![]).await;
        assert!(merged.is_ok());
        assert!(merged.results.is_empty());
    }
}
