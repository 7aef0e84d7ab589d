use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreditPack {
    pub id: String,
    #[serde(skip_serializing)]
    pub price_id: String,
    pub credits: i64,
    pub label: String,
}

impl CreditPack {
    /// Parses `id:price_id:credits[:label]`.
    pub fn parse(entry: &str) -> Result<Self, String> {
        let parts: Vec<&str> = entry.trim().split(':').map(str::trim).collect();
        if parts.len() < 3 || parts.len() > 4 {
            return Err(format!("expected id:price_id:credits[:label], got `{entry}`"));
        }
        let (id, price_id) = (parts[0], parts[1]);
        if id.is_empty() || price_id.is_empty() {
            return Err(format!("credit pack `{entry}` has an empty id or price"));
        }
        let credits = parts[2]
            .parse::<i64>()
            .map_err(|_| format!("credit pack `{id}` has a non-numeric credit count"))?;
        if credits <= 0 {
            return Err(format!("credit pack `{id}` must grant at least one credit"));
        }
        let label = parts
            .get(3)
            .filter(|l| !l.is_empty())
            .map(|l| l.to_string())
            .unwrap_or_else(|| format!("{credits} credits"));

        Ok(CreditPack {
            id: id.to_string(),
            price_id: price_id.to_string(),
            credits,
            label,
        })
    }

    pub fn parse_list(raw: &str) -> Result<Vec<Self>, String> {
        let packs = raw
            .split(',')
            .filter(|s| !s.trim().is_empty())
            .map(CreditPack::parse)
            .collect::<Result<Vec<_>, _>>()?;

        for (idx, pack) in packs.iter().enumerate() {
            if packs[..idx].iter().any(|p| p.id == pack.id) {
                return Err(format!("credit pack `{}` is defined twice", pack.id));
            }
        }
        Ok(packs)
    }
}
