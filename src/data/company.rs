//! Company identity (slug derivation) and the field-level merge rule.

use chrono::Utc;
use url::Url;

use crate::data::models::{AnalysisStatus, Company, CompanySize};

/// Derive the document key for a company from its display name and website.
///
/// The slug is the lowercased, dash-separated name joined with the normalized
/// website host, so "Acme Corp" + "https://www.acme.io/about" becomes
/// `acme-corp--acme.io`. A missing website yields just the name part.
pub fn company_slug(name: &str, website: Option<&str>) -> String {
    let name_part = slugify(name);
    match website.and_then(website_host) {
        Some(host) if !host.is_empty() => format!("{name_part}--{host}"),
        _ => name_part,
    }
}

/// Lowercased host with any leading `www.` removed.
pub fn website_host(website: &str) -> Option<String> {
    let parsed = if website.contains("://") {
        Url::parse(website).ok()?
    } else {
        Url::parse(&format!("https://{website}")).ok()?
    };
    let host = parsed.host_str()?.to_ascii_lowercase();
    Some(host.trim_start_matches("www.").to_string())
}

fn slugify(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_dash = true;
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    if out.is_empty() { "unknown".into() } else { out }
}

/// A freshly created record for a company that has not been analyzed yet.
pub fn minimal_company(slug: &str, name: &str, website: Option<&str>) -> Company {
    Company {
        slug: slug.to_string(),
        name: name.to_string(),
        website: website.map(str::to_string),
        about: None,
        mission: None,
        culture: None,
        size: CompanySize::Unknown,
        headquarters: None,
        tier: Default::default(),
        priority_score: 0.0,
        analysis_status: AnalysisStatus::Pending,
        analyzed_at: None,
    }
}

/// Merge `incoming` into `existing` without ever overwriting a non-empty
/// field with an empty one. Returns the merged record.
pub fn merge_company(existing: &Company, incoming: &Company) -> Company {
    fn pick(existing: &Option<String>, incoming: &Option<String>) -> Option<String> {
        match incoming {
            Some(v) if !v.trim().is_empty() => Some(v.clone()),
            _ => existing.clone(),
        }
    }

    Company {
        slug: existing.slug.clone(),
        name: if incoming.name.trim().is_empty() {
            existing.name.clone()
        } else {
            incoming.name.clone()
        },
        website: pick(&existing.website, &incoming.website),
        about: pick(&existing.about, &incoming.about),
        mission: pick(&existing.mission, &incoming.mission),
        culture: pick(&existing.culture, &incoming.culture),
        size: if incoming.size == CompanySize::Unknown {
            existing.size
        } else {
            incoming.size
        },
        headquarters: pick(&existing.headquarters, &incoming.headquarters),
        tier: incoming.tier,
        priority_score: if incoming.priority_score > 0.0 {
            incoming.priority_score
        } else {
            existing.priority_score
        },
        analysis_status: incoming.analysis_status,
        analyzed_at: incoming.analyzed_at.or(existing.analyzed_at),
    }
}

/// Stamp a record as analyzed now.
pub fn mark_analyzed(mut company: Company, status: AnalysisStatus) -> Company {
    company.analysis_status = status;
    company.analyzed_at = Some(Utc::now());
    company
}
