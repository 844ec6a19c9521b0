//! The key normalizer.
//!
//! Every pageview row and every sitelink row is funneled through
//! [`format_line`], which turns `(lang, site, title, value)` into one output
//! line `"<lang>.<site>/<title> <value>"`. Rows from both datasets that name
//! the same page must come out byte-identical here, because the downstream
//! join compares keys bytewise; all the historical project aliases are
//! therefore resolved in this one place instead of being scattered across
//! the pipeline.

use std::borrow::Cow;
use unicode_casefold::{Locale, UnicodeCaseFold, Variant};
use unicode_normalization::UnicodeNormalization;

/// Formats one normalized line. `value` is either a view count or an entity
/// id, depending on which dataset the row came from.
pub fn format_line(lang: &str, site: &str, title: &str, value: &str) -> String {
    let mut site = site;
    let mut title: Cow<str> = Cow::Borrowed(title);
    let mut locale = Locale::NonTurkic;

    // https://en.wikipedia.org/wiki/List_of_Wikipedias#Wikipedia_edition_codes
    let lang: Cow<str> = match lang {
        "" => {
            site = match site {
                "wikidatawiki" => "wikidata",
                "wikimaniawiki" => "wikimania",
                _ => site,
            };
            Cow::Borrowed("und")
        }

        "az" | "tr" => {
            locale = Locale::Turkic;
            Cow::Borrowed(lang)
        }

        "als" => Cow::Borrowed("gsw"),

        "bat_smg" | "bat-smg" => Cow::Borrowed("sgs"),

        "be_x_old" => Cow::Borrowed("be-tarask"),

        "cbk_zam" | "cbk-zam" => Cow::Borrowed("cbk-x-zam"),

        "commons" => {
            site = "commons";
            Cow::Borrowed("und")
        }

        "fiu_vro" | "fiu-vro" => Cow::Borrowed("vro"),

        "incubator" => match incubator_split(&title) {
            Some((code, rest)) => {
                title = Cow::Owned(rest);
                Cow::Owned(code)
            }
            None => Cow::Borrowed(lang),
        },

        // Banyumasan dialect of Javanese
        "map_bms" | "map-bms" => Cow::Borrowed("jv-x-bms"),

        // mediawiki.org
        "media" => {
            site = "mediawiki";
            Cow::Borrowed("und")
        }

        // meta.wikimedia.org
        "meta" => {
            site = "metawiki";
            Cow::Borrowed("und")
        }

        "roa_rup" | "roa-rup" => Cow::Borrowed("rup"),

        // Tarantino dialect of Neapolitan
        "roa_tara" | "roa-tara" => Cow::Borrowed("nap-x-tara"),

        // Simplified English
        "simple" => Cow::Borrowed("en-x-simple"),

        // The multilingual Wikisource, sitelinked as "sourceswiki".
        "sources" => {
            site = "wikisource";
            Cow::Borrowed("und")
        }

        "species" => {
            site = "wikispecies";
            Cow::Borrowed("und")
        }

        "nds_nl" | "nds-nl" => Cow::Borrowed("nds-NL"),

        "zh_classical" | "zh-classical" => Cow::Borrowed("lzh"),

        // https://phabricator.wikimedia.org/T30442
        "zh_min_nan" | "zh-min-nan" => Cow::Borrowed("nan"),

        "zh_yue" | "zh-yue" => Cow::Borrowed("yue"),

        _ => Cow::Borrowed(lang),
    };

    let mut out = String::with_capacity(lang.len() + site.len() + title.len() + value.len() + 3);
    out.push_str(&lang);
    out.push('.');
    out.push_str(site);
    out.push('/');
    // Full Unicode case folding (Turkic rules for az/tr so that dotted and
    // dotless I survive), then NFC. Code points at or below U+0020 collapse
    // to '_', which also catches NULs and tabs smuggled into titles.
    for ch in title
        .as_ref()
        .case_fold_with(Variant::Full, locale)
        .nfc()
    {
        if ch <= '\u{20}' {
            out.push('_');
        } else {
            out.push(ch);
        }
    }
    out.push(' ');
    out.push_str(value);
    out
}

/// Incubator pages carry their project in the title, for example
/// "Wp/cpx/Teng-cing-chī" for the cpx-language Wikipedia.
fn incubator_split(title: &str) -> Option<(String, String)> {
    let mut parts = title.splitn(3, '/');
    let prefix = parts.next()?;
    let code = parts.next()?;
    let rest = parts.next()?;
    if (prefix == "Wp" || prefix == "wp") && code.len() < 20 {
        Some((code.to_lowercase(), rest.to_string()))
    } else {
        None
    }
}
