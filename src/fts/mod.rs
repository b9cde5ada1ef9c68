//! Full-text document index with BM25 ranking.
//!
//! Documents are `(title, body)` string objects. The body is tokenised on
//! spaces, trimmed of punctuation, lowercased, stopword-filtered and stemmed;
//! surviving terms feed an inverted index from term to posting list. Search
//! scores every posting of every (deduplicated) query term with BM25 and
//! drains the per-document scores through a max-heap, yielding results in
//! descending score order.

mod stemmer;
mod stopwords;

use std::cmp::Ordering;

use bytes::Bytes;

use crate::{
    dict::Dict,
    minheap::MinHeap,
    object::RStr,
};

pub use self::stemmer::stem;
pub use self::stopwords::is_stopword;

const BM25_K: f64 = 1.2;
const BM25_B: f64 = 0.75;

/// Characters trimmed from both ends of every raw token.
const PUNCTUATION: &[u8] = b",.:;?!";

/// An indexed document.
#[derive(Debug)]
pub struct Doc {
    pub title: RStr,
    pub body: RStr,
    /// Document length in words, stopwords excluded.
    pub len: u32,
}

#[derive(Debug)]
struct Posting {
    /// Key of the document in the docs dictionary.
    title: Bytes,
    /// Term frequency within that document.
    tf: u32,
}

/// The index payload of an `Fts` value.
#[derive(Debug, Default)]
pub struct Fts {
    docs: Dict<Doc>,
    index: Dict<Vec<Posting>>,
    /// Sum of all document lengths, maintained on add/delete.
    total_len: i64,
}

impl Fts {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of indexed documents.
    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    pub fn total_len(&self) -> i64 {
        self.total_len
    }

    /// Add a document, replacing any existing document with the same title.
    /// The index holds exactly one reference to the title and the body.
    pub fn add(&mut self, title: &RStr, body: &RStr) {
        if self.docs.contains_key(&title.as_bytes()) {
            self.del(title);
        }

        let key = Bytes::copy_from_slice(&title.as_bytes());
        let mut words = 0u32;
        for term in terms(&body.as_bytes()) {
            words += 1;
            match self.index.get_mut(&term) {
                Some(postings) => match postings.iter_mut().find(|p| p.title == key) {
                    Some(posting) => posting.tf += 1,
                    None => postings.push(Posting {
                        title: key.clone(),
                        tf: 1,
                    }),
                },
                None => {
                    self.index.insert(
                        &term,
                        vec![Posting {
                            title: key.clone(),
                            tf: 1,
                        }],
                    );
                }
            }
        }

        self.docs.insert(
            &key,
            Doc {
                title: title.clone(),
                body: body.clone(),
                len: words,
            },
        );
        self.total_len += i64::from(words);
    }

    pub fn get(&self, title: &RStr) -> Option<&Doc> {
        self.docs.get(&title.as_bytes())
    }

    /// Remove a document, unwinding its postings by tokenising the stored
    /// body again.
    pub fn del(&mut self, title: &RStr) -> bool {
        let Some(doc) = self.docs.remove(&title.as_bytes()) else {
            return false;
        };

        let key = &*title.as_bytes();
        for term in terms(&doc.body.as_bytes()) {
            let emptied = match self.index.get_mut(&term) {
                Some(postings) => {
                    if let Some(at) = postings.iter().position(|p| p.title.as_ref() == key) {
                        postings[at].tf -= 1;
                        if postings[at].tf == 0 {
                            postings.remove(at);
                        }
                    }
                    postings.is_empty()
                }
                None => false,
            };
            if emptied {
                self.index.remove(&term);
            }
        }

        self.total_len -= i64::from(doc.len);
        true
    }

    /// BM25-rank every document matching at least one query term.
    pub fn search(&self, query: &[u8]) -> SearchResults {
        let mut scores: Dict<f64> = Dict::new();
        let mut queried: Dict<()> = Dict::new();

        let n_docs = self.docs.len().max(1) as f64;
        let avgdl = self.total_len as f64 / n_docs;

        for term in terms(query) {
            if queried.insert(&term, ()).is_some() {
                continue;
            }
            let Some(postings) = self.index.get(&term) else {
                continue;
            };
            let nq = postings.len() as f64;
            let idf = ((n_docs - nq + 0.5) / (nq + 0.5)).ln();
            for posting in postings {
                let Some(doc) = self.docs.get(&posting.title) else {
                    continue;
                };
                let tf = f64::from(posting.tf);
                let dl = f64::from(doc.len);
                let norm = tf * (BM25_K + 1.0)
                    / (tf + BM25_K * (1.0 - BM25_B + BM25_B * dl / avgdl));
                let contribution = idf * norm;
                match scores.get_mut(&posting.title) {
                    Some(score) => *score += contribution,
                    None => {
                        scores.insert(&posting.title, contribution);
                    }
                }
            }
        }

        // Scores drain through an inverted-comparator heap: highest first.
        // Pushes happen in lexicographic title order and tied scores pop in
        // reverse push order, so ties are stable within one search.
        let mut heap = MinHeap::with_capacity(scores.len(), scored_cmp);
        for (title, score) in &scores {
            if let Some(doc) = self.docs.get(title) {
                heap.push(Scored {
                    title: doc.title.clone(),
                    body: doc.body.clone(),
                    score: *score,
                });
            }
        }
        SearchResults { heap }
    }
}

/// A ranked search hit.
#[derive(Debug)]
pub struct Scored {
    pub title: RStr,
    pub body: RStr,
    pub score: f64,
}

fn scored_cmp(a: &Scored, b: &Scored) -> Ordering {
    b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal)
}

/// Iterator over search hits in descending BM25 order.
#[derive(Debug)]
pub struct SearchResults {
    heap: MinHeap<Scored>,
}

impl SearchResults {
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

impl Iterator for SearchResults {
    type Item = Scored;

    fn next(&mut self) -> Option<Scored> {
        self.heap.pop()
    }
}

/// Normalised index terms of a text: split on spaces, trim punctuation,
/// lowercase, drop empties and stopwords, stem the rest.
fn terms(text: &[u8]) -> impl Iterator<Item = Vec<u8>> + '_ {
    text.split(|b| *b == b' ').filter_map(|raw| {
        let trimmed = trim_punctuation(raw);
        if trimmed.is_empty() {
            return None;
        }
        let mut word = trimmed.to_ascii_lowercase();
        if stopwords::is_stopword(&word) {
            return None;
        }
        stemmer::stem(&mut word);
        Some(word)
    })
}

fn trim_punctuation(mut token: &[u8]) -> &[u8] {
    while let [first, rest @ ..] = token {
        if !PUNCTUATION.contains(first) {
            break;
        }
        token = rest;
    }
    while let [rest @ .., last] = token {
        if !PUNCTUATION.contains(last) {
            break;
        }
        token = rest;
    }
    token
}

#[cfg(test)]
mod tests {
    use crate::object::{RStr, StrObject};

    use super::{terms, Fts};

    fn s(text: &str) -> RStr {
        StrObject::from_slice(text.as_bytes())
    }

    fn titles(fts: &Fts, query: &str) -> Vec<String> {
        fts.search(query.as_bytes())
            .map(|hit| String::from_utf8_lossy(&hit.title.as_bytes()).into_owned())
            .collect()
    }

    #[test]
    fn tokenisation() {
        let got = terms(b"The quick, brown fox; jumped!")
            .map(|t| String::from_utf8(t).unwrap())
            .collect::<Vec<_>>();
        // "The" is a stopword, the rest is trimmed, lowercased and stemmed.
        assert_eq!(got, ["quick", "brown", "fox", "jump"]);
    }

    #[test]
    fn add_get_del() {
        let mut fts = Fts::new();
        assert!(fts.is_empty());

        fts.add(&s("t1"), &s("the quick brown fox"));
        assert_eq!(fts.len(), 1);
        assert_eq!(fts.total_len(), 3);

        let doc = fts.get(&s("t1")).unwrap();
        assert_eq!(&*doc.body.as_bytes(), b"the quick brown fox");
        assert_eq!(doc.len, 3);

        assert!(fts.del(&s("t1")));
        assert!(!fts.del(&s("t1")));
        assert!(fts.is_empty());
        assert_eq!(fts.total_len(), 0);
        assert!(fts.get(&s("t1")).is_none());
    }

    #[test]
    fn re_adding_a_title_replaces_the_document() {
        let mut fts = Fts::new();
        fts.add(&s("t"), &s("alpha beta"));
        fts.add(&s("t"), &s("gamma"));
        assert_eq!(fts.len(), 1);
        assert_eq!(fts.total_len(), 1);
        assert!(titles(&fts, "alpha").is_empty());
        assert_eq!(titles(&fts, "gamma"), ["t"]);
    }

    #[test]
    fn search_matches_stemmed_terms() {
        let mut fts = Fts::new();
        fts.add(&s("doc"), &s("searching documents quickly"));
        // Query words stem to the same terms as the body words.
        assert_eq!(titles(&fts, "searched"), ["doc"]);
        assert_eq!(titles(&fts, "document"), ["doc"]);
        assert!(titles(&fts, "missing").is_empty());
        // Stopword-only queries match nothing.
        assert!(titles(&fts, "the and of").is_empty());
    }

    #[test]
    fn rarer_terms_rank_higher() {
        let mut fts = Fts::new();
        fts.add(&s("common1"), &s("wolf wolf den"));
        fts.add(&s("common2"), &s("wolf river den"));
        fts.add(&s("rare"), &s("eagle nest den"));
        // Only the eagle document matches.
        let got = titles(&fts, "eagle");
        assert_eq!(got, ["rare"]);
    }

    #[test]
    fn higher_tf_ranks_higher_at_equal_length() {
        let mut fts = Fts::new();
        fts.add(&s("twice"), &s("otter otter pond"));
        fts.add(&s("once"), &s("otter stream pond"));
        // Padding documents keep the query term rare enough for a positive
        // idf, so frequency dominance translates into a higher score.
        fts.add(&s("pad1"), &s("badger sett field"));
        fts.add(&s("pad2"), &s("heron reed marsh"));
        fts.add(&s("pad3"), &s("vole bank burrow"));
        let got = titles(&fts, "otter");
        assert_eq!(got, ["twice", "once"]);
    }

    #[test]
    fn tied_scores_are_stable() {
        let mut fts = Fts::new();
        fts.add(&s("t1"), &s("the quick brown fox"));
        fts.add(&s("t2"), &s("quick brown dogs"));
        // Both documents have three indexed words and one "brown" each: the
        // scores tie exactly, and the tie resolves to the later push (t2).
        let got = titles(&fts, "brown");
        assert_eq!(got, ["t2", "t1"]);
    }

    #[test]
    fn term_frequency_accumulates_and_unwinds() {
        let mut fts = Fts::new();
        fts.add(&s("a"), &s("fish fish fish"));
        fts.add(&s("b"), &s("fish chips"));
        assert_eq!(fts.total_len(), 5);

        assert_eq!(titles(&fts, "fish"), ["a", "b"]);

        fts.del(&s("a"));
        assert_eq!(fts.total_len(), 2);
        assert_eq!(titles(&fts, "fish"), ["b"]);

        fts.del(&s("b"));
        assert!(titles(&fts, "fish").is_empty());
        assert_eq!(fts.total_len(), 0);
    }
}
