use std::cell::RefCell;
use std::rc::Rc;

use crate::future::{Awaitable, IntoPromise, Promise};

struct AllState<T> {
    values: Vec<Option<T>>,
    remaining: usize,
}

impl<T: Clone + 'static> Promise<T> {
    /// Fulfills with every input's value, in input order, once all of them
    /// fulfill. Rejects with the first rejection observed without waiting for
    /// the remaining inputs.
    pub fn all<I>(inputs: I) -> Promise<Vec<T>>
    where
        I: IntoIterator,
        I::Item: Into<Awaitable<T>>,
    {
        let entries: Vec<Promise<T>> = inputs
            .into_iter()
            .map(|input| Into::<Awaitable<T>>::into(input).into_promise())
            .collect();

        if entries.is_empty() {
            return Promise::resolve(Vec::new());
        }

        let (combined, resolver) = Promise::pending();
        let state = Rc::new(RefCell::new(AllState {
            values: vec![None; entries.len()],
            remaining: entries.len(),
        }));

        for (index, entry) in entries.into_iter().enumerate() {
            if resolver.is_settled() {
                break;
            }
            let state = state.clone();
            let resolver = resolver.clone();
            entry.subscribe(move |outcome| match outcome {
                Ok(value) => {
                    let finished = {
                        let mut state = state.borrow_mut();
                        state.values[index] = Some(value);
                        state.remaining -= 1;
                        if state.remaining == 0 {
                            Some(state.values.drain(..).flatten().collect::<Vec<T>>())
                        } else {
                            None
                        }
                    };
                    if let Some(values) = finished {
                        resolver.resolve(values);
                    }
                }
                Err(reason) => {
                    resolver.reject(reason);
                }
            });
        }

        combined
    }

    /// Settles with the outcome of whichever input settles first. Later
    /// settlements are ignored; an empty input never settles.
    pub fn race<I>(inputs: I) -> Promise<T>
    where
        I: IntoIterator,
        I::Item: Into<Awaitable<T>>,
    {
        let (winner, resolver) = Promise::pending();
        for input in inputs {
            if resolver.is_settled() {
                break;
            }
            let resolver = resolver.clone();
            let entry: Awaitable<T> = input.into();
            entry.into_promise().subscribe(move |outcome| {
                resolver.settle(outcome);
            });
        }
        winner
    }
}
