//! Cache key generation
//!
//! Keys render as `<domain>-<discriminator>-<discriminator>...`. Lists are joined with `,` in
//! the order given. A `-`, `,` or `\` inside a discriminator is escaped with `\`, so distinct
//! part lists render distinct keys. An absent optional renders as an empty segment
//! (`history-1-0xA--20`); an empty value renders the same way and names the same entry.

use std::fmt;

/// The fixed set of cacheable data families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheDomain {
    /// Token metadata; near-static.
    Token,
    /// Spot prices.
    Price,
    /// Portfolio valuations.
    Portfolio,
    /// Wallet balances.
    Balance,
    /// Transaction history pages.
    History,
    /// Swap quotes; the most volatile.
    Swap,
}

impl CacheDomain {
    /// Every domain, in declaration order.
    pub const ALL: [CacheDomain; 6] = [
        CacheDomain::Token,
        CacheDomain::Price,
        CacheDomain::Portfolio,
        CacheDomain::Balance,
        CacheDomain::History,
        CacheDomain::Swap,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CacheDomain::Token => "token",
            CacheDomain::Price => "price",
            CacheDomain::Portfolio => "portfolio",
            CacheDomain::Balance => "balance",
            CacheDomain::History => "history",
            CacheDomain::Swap => "swap",
        }
    }
}

impl fmt::Display for CacheDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A rendered, domain-scoped cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    domain: CacheDomain,
    rendered: String,
}

impl CacheKey {
    /// Start a key in `domain`.
    pub fn builder(domain: CacheDomain) -> CacheKeyBuilder {
        CacheKeyBuilder { domain, rendered: domain.as_str().to_string() }
    }

    /// Token metadata for one address on one chain.
    pub fn token(chain_id: u64, address: &str) -> Self {
        Self::builder(CacheDomain::Token).part(chain_id).part(address).build()
    }

    /// Prices for a set of tokens quoted in `currency`.
    pub fn price<I, S>(chain_id: u64, addresses: I, currency: &str) -> Self
    where
        I: IntoIterator<Item = S>,
        S: fmt::Display,
    {
        Self::builder(CacheDomain::Price).part(chain_id).parts(addresses).part(currency).build()
    }

    /// Portfolio valuation for a set of wallets.
    pub fn portfolio<I, S>(chain_id: u64, wallets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: fmt::Display,
    {
        Self::builder(CacheDomain::Portfolio).part(chain_id).parts(wallets).build()
    }

    /// Balances for one wallet.
    pub fn balance(chain_id: u64, wallet: &str) -> Self {
        Self::builder(CacheDomain::Balance).part(chain_id).part(wallet).build()
    }

    /// One page of history for a wallet.
    pub fn history(chain_id: u64, wallet: &str, cursor: Option<&str>, limit: u32) -> Self {
        Self::builder(CacheDomain::History)
            .part(chain_id)
            .part(wallet)
            .optional(cursor)
            .part(limit)
            .build()
    }

    /// A swap quote for `amount` of `src` into `dst`.
    pub fn swap(chain_id: u64, src: &str, dst: &str, amount: &str) -> Self {
        Self::builder(CacheDomain::Swap).part(chain_id).part(src).part(dst).part(amount).build()
    }

    pub fn domain(&self) -> CacheDomain {
        self.domain
    }

    pub fn as_str(&self) -> &str {
        &self.rendered
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.rendered)
    }
}

impl From<CacheKey> for String {
    fn from(key: CacheKey) -> Self {
        key.rendered
    }
}

/// Appends discriminators to a [`CacheKey`] in call order.
#[derive(Debug, Clone)]
pub struct CacheKeyBuilder {
    domain: CacheDomain,
    rendered: String,
}

impl CacheKeyBuilder {
    /// Append one discriminator.
    pub fn part(mut self, value: impl fmt::Display) -> Self {
        use fmt::Write;
        self.rendered.push('-');
        let _ = write!(Escaped(&mut self.rendered), "{}", value);
        self
    }

    /// Append a list as a single `,`-joined discriminator.
    pub fn parts<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: fmt::Display,
    {
        use fmt::Write;
        self.rendered.push('-');
        for (i, value) in values.into_iter().enumerate() {
            if i > 0 {
                self.rendered.push(',');
            }
            let _ = write!(Escaped(&mut self.rendered), "{}", value);
        }
        self
    }

    /// Append an optional discriminator; `None` renders as an empty segment, like `Some("")`.
    pub fn optional(self, value: Option<impl fmt::Display>) -> Self {
        match value {
            Some(value) => self.part(value),
            None => self.part(""),
        }
    }

    pub fn build(self) -> CacheKey {
        CacheKey { domain: self.domain, rendered: self.rendered }
    }
}

/// Escapes key separators while a discriminator is written.
struct Escaped<'a>(&'a mut String);

impl fmt::Write for Escaped<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for c in s.chars() {
            if matches!(c, '-' | ',' | '\\') {
                self.0.push('\\');
            }
            self.0.push(c);
        }
        Ok(())
    }
}
